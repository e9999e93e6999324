//! Dispatch engine: record or play back intercepted requests

mod dispatch;
mod request;
mod state;

pub use dispatch::{Dispatch, DispatchStats, Dispatcher, Upstream};
pub use request::{read_body, BufferedRequest};
pub use state::{DestinationMatcher, ProxyState, RegexMatcher, Settings};
