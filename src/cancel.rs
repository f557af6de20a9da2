// Copyright 2020 Joyent, Inc.

//! Delivery of cancellation notifications to in-flight work.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use slog::{debug, o, warn, Drain, Logger};
use tokio_util::sync::CancellationToken;

use crate::id::RequestId;

/// The signal side of a cancellation, shared between the propagator and
/// whatever is doing the work.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        CancellationHandle::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether `other` is a clone of this handle rather than an
    /// independent one.
    pub fn same_source(&self, other: &CancellationHandle) -> bool {
        Arc::ptr_eq(&self.reason, &other.reason)
    }

    /// Trigger the signal. Only the first reason is kept.
    pub fn cancel(&self, reason: Option<String>) {
        {
            let mut slot = self.reason.lock();
            if !self.token.is_cancelled() && slot.is_none() {
                *slot = reason;
            }
        }
        self.token.cancel();
    }
}

pub struct CancellationPropagator {
    entries: Mutex<HashMap<RequestId, CancellationHandle>>,
    log: Logger,
}

impl CancellationPropagator {
    pub fn new(log: Option<&Logger>) -> Self {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        CancellationPropagator {
            entries: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn register_request(&self, id: RequestId, source: CancellationHandle) {
        if self.entries.lock().insert(id.clone(), source).is_some() {
            warn!(self.log, "cancellation source replaced for request"; "id" => %id);
        }
    }

    /// Signal the work registered under `id` and forget the association.
    ///
    /// Returns false when nothing is registered, which is the normal case
    /// for a notification that lost the race with completion or arrived
    /// before registration. Neither is remembered.
    pub fn handle_cancelled(&self, id: &RequestId, reason: Option<String>) -> bool {
        let source = self.entries.lock().remove(id);
        match source {
            Some(source) => {
                debug!(self.log, "cancelling request"; "id" => %id,
                       "reason" => reason.as_deref().unwrap_or("none"));
                source.cancel(reason);
                true
            }
            None => {
                debug!(self.log, "cancellation for unknown request ignored"; "id" => %id);
                false
            }
        }
    }

    pub fn unregister_request(&self, id: &RequestId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Remove the association for `id` only if it still points at `source`.
    pub fn unregister_source(&self, id: &RequestId, source: &CancellationHandle) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(current) if current.same_source(source) => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Signal and forget every registered request.
    pub fn cancel_all(&self, reason: Option<String>) -> usize {
        let sources: Vec<CancellationHandle> =
            self.entries.lock().drain().map(|(_, s)| s).collect();
        for source in &sources {
            source.cancel(reason.clone());
        }
        sources.len()
    }

    pub fn is_registered(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn registered_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn cancellation_reaches_the_registered_handle() {
        let propagator = CancellationPropagator::new(None);
        let handle = CancellationHandle::new();
        let id = RequestId::Number(3);
        propagator.register_request(id.clone(), handle.clone());

        assert!(propagator.handle_cancelled(&id, Some(String::from("shutdown"))));
        assert!(handle.is_cancelled());
        assert_eq!(handle.reason().as_deref(), Some("shutdown"));
        assert!(!propagator.is_registered(&id));
    }

    #[test]
    fn late_cancellation_is_a_no_op() {
        let propagator = CancellationPropagator::new(None);
        let handle = CancellationHandle::new();
        let id = RequestId::from("done");
        propagator.register_request(id.clone(), handle.clone());
        assert!(propagator.unregister_request(&id));

        assert!(!propagator.handle_cancelled(&id, None));
        assert!(!handle.is_cancelled());
        assert_eq!(propagator.registered_count(), 0);
    }

    #[test]
    fn early_cancellation_is_not_remembered() {
        let propagator = CancellationPropagator::new(None);
        let id = RequestId::Number(9);
        assert!(!propagator.handle_cancelled(&id, Some(String::from("early"))));

        let handle = CancellationHandle::new();
        propagator.register_request(id.clone(), handle.clone());
        assert!(!handle.is_cancelled());
        assert!(propagator.is_registered(&id));
    }

    #[test]
    fn cancel_all_signals_everything() {
        let propagator = CancellationPropagator::new(None);
        let handles: Vec<CancellationHandle> = (0..3)
            .map(|n| {
                let h = CancellationHandle::new();
                propagator.register_request(RequestId::Number(n), h.clone());
                h
            })
            .collect();
        assert_eq!(propagator.cancel_all(Some(String::from("closing"))), 3);
        assert!(handles.iter().all(|h| h.is_cancelled()));
        assert_eq!(propagator.registered_count(), 0);
    }

    #[test]
    fn stale_source_does_not_unregister_its_replacement() {
        let propagator = CancellationPropagator::new(None);
        let id = RequestId::Number(4);
        let old = CancellationHandle::new();
        let new = CancellationHandle::new();
        propagator.register_request(id.clone(), old.clone());
        propagator.register_request(id.clone(), new.clone());

        assert!(!propagator.unregister_source(&id, &old));
        assert!(propagator.is_registered(&id));
        assert!(propagator.unregister_source(&id, &new.clone()));
        assert!(!propagator.is_registered(&id));
    }

    #[test]
    fn first_reason_wins() {
        let handle = CancellationHandle::new();
        handle.cancel(Some(String::from("first")));
        handle.cancel(Some(String::from("second")));
        assert_eq!(handle.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn waiters_wake_on_cancel() {
        let propagator = Arc::new(CancellationPropagator::new(None));
        let handle = CancellationHandle::new();
        propagator.register_request(RequestId::Number(1), handle.clone());

        let waiter = tokio::spawn(async move {
            handle.cancelled().await;
            handle.reason()
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        propagator.handle_cancelled(&RequestId::Number(1), Some(String::from("stop")));

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason.as_deref(), Some("stop"));
    }
}
