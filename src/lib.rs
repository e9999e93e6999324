//! genproxy - record/playback man-in-the-middle HTTP proxy
//!
//! In record mode, live responses for intercepted destinations are stored in
//! Redis under a fingerprint of the request. In playback mode the stored
//! responses are served instead, and the destination is never contacted.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod network;
pub mod proxy;
pub mod storage;

pub use error::{ProxyError, Result};
