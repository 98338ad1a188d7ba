//! Pack requests handed out by the manager

use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for the index or for a download slot.
    Queued,
    /// At least one file of the pack's closure is being fetched.
    Downloading,
    /// The pack and all its dependencies are in the local store.
    Downloaded,
    /// The pack can't be delivered (unknown name or a local write failure).
    Failed,
}

/// A request for one pack and, implicitly, its dependencies.
///
/// The manager hands out one shared instance per pack name; every clone
/// observes the same state.
#[derive(Debug)]
pub struct PackRequest {
    name: String,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: RequestState,
    failure: Option<String>,
}

impl PackRequest {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Inner {
                state: RequestState::Queued,
                failure: None,
            }),
        }
    }

    pub fn requested_pack_name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RequestState {
        self.lock().state
    }

    pub fn is_downloaded(&self) -> bool {
        self.state() == RequestState::Downloaded
    }

    /// Why the request failed, if it did.
    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    /// Move to `state`; returns whether anything changed.
    ///
    /// `Downloaded` is final.
    pub(crate) fn set_state(&self, state: RequestState) -> bool {
        let mut inner = self.lock();
        if inner.state == state || inner.state == RequestState::Downloaded {
            return false;
        }
        inner.state = state;
        if state != RequestState::Failed {
            inner.failure = None;
        }
        true
    }

    pub(crate) fn fail(&self, reason: &str) -> bool {
        let mut inner = self.lock();
        if matches!(inner.state, RequestState::Downloaded | RequestState::Failed) {
            return false;
        }
        inner.state = RequestState::Failed;
        inner.failure = Some(reason.to_string());
        true
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downloaded_is_final() {
        let request = PackRequest::new("3");
        assert_eq!(request.requested_pack_name(), "3");
        assert!(request.set_state(RequestState::Downloading));
        assert!(!request.set_state(RequestState::Downloading));
        assert!(request.set_state(RequestState::Downloaded));
        assert!(request.is_downloaded());

        assert!(!request.set_state(RequestState::Queued));
        assert!(!request.fail("late"));
        assert!(request.is_downloaded());
    }

    #[test]
    fn test_failure_reason() {
        let request = PackRequest::new("missing");
        assert!(request.fail("unknown pack"));
        assert_eq!(request.state(), RequestState::Failed);
        assert_eq!(request.failure().as_deref(), Some("unknown pack"));

        assert!(request.set_state(RequestState::Queued));
        assert!(request.failure().is_none());
    }
}
