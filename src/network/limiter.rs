//! Admission control for accepted proxy connections

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps how many accepted connections are served at once
///
/// Connections over the cap are refused outright rather than queued.
#[derive(Clone)]
pub struct ConnectionLimiter {
    slots: Arc<Semaphore>,
    limit: usize,
}

impl ConnectionLimiter {
    /// Create a limiter; a limit of 0 is raised to 1
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);

        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Admit the connection from `peer` if a slot is free
    ///
    /// Returns `None` when every slot is taken or admission has stopped.
    pub fn admit(&self, peer: SocketAddr) -> Option<Admission> {
        let slot = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        Some(Admission { _slot: slot, peer })
    }

    /// Refuse all further connections; admitted ones keep their slots
    pub fn stop_admitting(&self) {
        self.slots.close();
    }

    /// Connections currently holding a slot
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    /// Configured cap
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Slot held for the lifetime of one served connection
#[must_use = "the slot is released as soon as the admission is dropped"]
pub struct Admission {
    _slot: OwnedSemaphorePermit,
    peer: SocketAddr,
}

impl Admission {
    /// Client address of the admitted connection
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_slots_released_on_drop() {
        let limiter = ConnectionLimiter::new(2);

        let first = limiter.admit(peer(1)).unwrap();
        let second = limiter.admit(peer(2)).unwrap();
        assert_eq!(limiter.in_flight(), 2);
        assert_eq!(second.peer(), peer(2));
        assert!(limiter.admit(peer(3)).is_none());

        drop(first);
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.admit(peer(3)).is_some());
    }

    #[test]
    fn test_stopped_limiter_refuses() {
        let limiter = ConnectionLimiter::new(4);
        let admitted = limiter.admit(peer(1)).unwrap();

        limiter.stop_admitting();
        assert!(limiter.admit(peer(2)).is_none());
        assert_eq!(limiter.in_flight(), 1);

        drop(admitted);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_zero_limit_raised() {
        let limiter = ConnectionLimiter::new(0);
        assert_eq!(limiter.limit(), 1);
        assert!(limiter.admit(peer(1)).is_some());
    }
}
