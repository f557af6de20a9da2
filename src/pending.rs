// Copyright 2020 Joyent, Inc.

//! Correlation of outbound calls with their eventual responses.
//!
//! A call's callbacks live in the table until exactly one path removes
//! them: a response, a timeout or a cancellation. Removal happens under the
//! table lock and hands the entry back to the caller, so the callback runs
//! outside the lock and a path that loses the race finds nothing to do.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use slog::{debug, o, warn, Drain, Logger};

use crate::error::RpcError;
use crate::id::RequestId;

pub type SuccessCallback = Box<dyn FnOnce(Value) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(RpcError) + Send>;

/// An outstanding call and the pair of callbacks that will resolve it.
pub struct PendingRequest {
    pub id: RequestId,
    on_success: SuccessCallback,
    on_error: ErrorCallback,
}

impl PendingRequest {
    pub fn new(
        id: RequestId,
        on_success: SuccessCallback,
        on_error: ErrorCallback,
    ) -> Self {
        PendingRequest {
            id,
            on_success,
            on_error,
        }
    }

    /// Consume the entry, firing exactly one of its callbacks.
    pub fn resolve(self, outcome: Result<Value, RpcError>) {
        match outcome {
            Ok(result) => (self.on_success)(result),
            Err(err) => (self.on_error)(err),
        }
    }

    pub fn fail(self, err: RpcError) {
        (self.on_error)(err)
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PendingRequest").field("id", &self.id).finish()
    }
}

pub struct PendingRequestTable {
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
    log: Logger,
}

impl PendingRequestTable {
    pub fn new(log: Option<&Logger>) -> Self {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        PendingRequestTable {
            entries: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Store the callbacks for `id`. A previous entry under the same id is
    /// dropped without either of its callbacks firing.
    pub fn register(
        &self,
        id: RequestId,
        on_success: SuccessCallback,
        on_error: ErrorCallback,
    ) {
        let entry = PendingRequest::new(id.clone(), on_success, on_error);
        let replaced = self.entries.lock().insert(id.clone(), entry);
        if replaced.is_some() {
            warn!(self.log, "request id registered twice, dropping earlier callbacks";
                  "id" => %id);
        }
    }

    /// Remove and return the entry for `id`, if it is still pending.
    pub fn complete(&self, id: &RequestId) -> Option<PendingRequest> {
        let entry = self.entries.lock().remove(id);
        if entry.is_none() {
            debug!(self.log, "no pending request for id"; "id" => %id);
        }
        entry
    }

    /// Same removal as `complete`, for the timeout and cancellation paths.
    /// The caller still owns firing a callback on the returned entry.
    pub fn cancel(&self, id: &RequestId) -> Option<PendingRequest> {
        self.complete(id)
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Remove every entry. Used when the connection goes away.
    pub fn drain(&self) -> Vec<PendingRequest> {
        self.entries.lock().drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[derive(Default)]
    struct Fired {
        success: AtomicUsize,
        error: AtomicUsize,
    }

    impl Fired {
        fn total(&self) -> usize {
            self.success.load(Ordering::SeqCst) + self.error.load(Ordering::SeqCst)
        }
    }

    fn register_counting(table: &PendingRequestTable, id: RequestId, fired: &Arc<Fired>) {
        let ok = Arc::clone(fired);
        let err = Arc::clone(fired);
        table.register(
            id,
            Box::new(move |_| {
                ok.success.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |_| {
                err.error.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    #[test]
    fn complete_removes_exactly_once() {
        let table = PendingRequestTable::new(None);
        let fired = Arc::new(Fired::default());
        register_counting(&table, RequestId::Number(1), &fired);
        assert_eq!(table.pending_count(), 1);

        let entry = table.complete(&RequestId::Number(1)).unwrap();
        assert!(table.complete(&RequestId::Number(1)).is_none());
        assert!(table.cancel(&RequestId::Number(1)).is_none());
        entry.resolve(Ok(Value::Null));

        assert_eq!(fired.success.load(Ordering::SeqCst), 1);
        assert_eq!(fired.total(), 1);
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn reregistering_drops_old_callbacks() {
        let table = PendingRequestTable::new(None);
        let old = Arc::new(Fired::default());
        let new = Arc::new(Fired::default());
        register_counting(&table, RequestId::from("dup"), &old);
        register_counting(&table, RequestId::from("dup"), &new);
        assert_eq!(table.pending_count(), 1);

        table
            .complete(&RequestId::from("dup"))
            .unwrap()
            .fail(RpcError::Timeout);
        assert_eq!(old.total(), 0);
        assert_eq!(new.error.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn racing_removers_fire_one_callback() {
        let table = Arc::new(PendingRequestTable::new(None));
        for round in 0..200 {
            let id = RequestId::Number(round);
            let fired = Arc::new(Fired::default());
            register_counting(&table, id.clone(), &fired);

            let barrier = Arc::new(Barrier::new(3));
            let outcomes = vec![
                Ok(Value::Bool(true)),
                Err(RpcError::Timeout),
                Err(RpcError::Cancelled { reason: None }),
            ];
            let handles: Vec<_> = outcomes
                .into_iter()
                .map(|outcome| {
                    let table = Arc::clone(&table);
                    let barrier = Arc::clone(&barrier);
                    let id = id.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        if let Some(entry) = table.complete(&id) {
                            entry.resolve(outcome);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(fired.total(), 1, "round {}", round);
        }
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn drain_empties_the_table() {
        let table = PendingRequestTable::new(None);
        let fired = Arc::new(Fired::default());
        for n in 0..5 {
            register_counting(&table, RequestId::Number(n), &fired);
        }
        for entry in table.drain() {
            entry.fail(RpcError::Disconnected);
        }
        assert_eq!(fired.error.load(Ordering::SeqCst), 5);
        assert_eq!(table.pending_count(), 0);
    }
}
