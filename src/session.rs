// Copyright 2020 Joyent, Inc.

//! The request lifecycle of one connection.
//!
//! A `Session` issues calls to the peer and settles each of them exactly
//! once, whichever of these happens first:
//!
//! * a response arrives (`on_response_arrived`)
//! * the call's deadline passes (`check_timeouts`)
//! * the call is cancelled, by the peer (`on_cancellation_notification`)
//!   or locally (`cancel_call`)
//!
//! Each path races to remove the call from the pending table. Only the
//! winner gets the callbacks back, so late and duplicate arrivals fall
//! through as no-ops.
//!
//! Requests the peer sends to us are tracked separately, in their own
//! cancellation table keyed by the peer's identifiers. A cancellation
//! notification from the peer is matched against that table first and
//! only reaches our own calls when no peer request holds the identifier.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use parking_lot::Mutex;
use serde_derive::Deserialize;
use serde_json::Value;
use slog::{debug, error, o, Drain, Logger};
use tokio::task::JoinHandle;

use crate::cancel::{CancellationHandle, CancellationPropagator};
use crate::deadline::DeadlineTracker;
use crate::error::RpcError;
use crate::id::{IdGenerator, RequestId};
use crate::pending::PendingRequestTable;
use crate::protocol::{ErrorObject, Message, Notification};
use crate::task::TaskEngine;

/// Where serialized outbound messages go.
pub trait Outbound: Send + Sync {
    fn send(&self, message: Message) -> io::Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline applied to calls issued without an explicit timeout.
    /// `None` leaves such calls without a deadline.
    pub default_timeout_ms: Option<u64>,
    /// Cadence of the background sweep for deadlines and expired tasks.
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            default_timeout_ms: Some(60_000),
            sweep_interval_ms: 100,
        }
    }
}

pub struct Session {
    ids: IdGenerator,
    pending: Arc<PendingRequestTable>,
    deadlines: DeadlineTracker,
    inbound: CancellationPropagator,
    transport: Arc<dyn Outbound>,
    config: SessionConfig,
    log: Logger,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Outbound>,
        log: Option<&Logger>,
    ) -> Self {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Session {
            ids: IdGenerator::new(),
            pending: Arc::new(PendingRequestTable::new(Some(&log))),
            deadlines: DeadlineTracker::new(Some(&log)),
            inbound: CancellationPropagator::new(Some(&log)),
            transport,
            config,
            log,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Send a request to the peer. Exactly one of `on_success` and
    /// `on_error` will eventually run, possibly before this returns if the
    /// transport refuses the message.
    pub fn issue_call<S, E>(
        &self,
        method: &str,
        params: Option<Value>,
        on_success: S,
        on_error: E,
        timeout: Option<Duration>,
    ) -> RequestId
    where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(RpcError) + Send + 'static,
    {
        let id = self.ids.next_id();
        self.pending
            .register(id.clone(), Box::new(on_success), Box::new(on_error));

        let timeout = timeout.or_else(|| {
            self.config.default_timeout_ms.map(Duration::from_millis)
        });
        if let Some(timeout) = timeout {
            let pending = Arc::clone(&self.pending);
            let transport = Arc::clone(&self.transport);
            let log = self.log.clone();
            self.deadlines.set_timeout(
                id.clone(),
                timeout,
                Box::new(move |id| {
                    let entry = match pending.cancel(&id) {
                        Some(entry) => entry,
                        None => return,
                    };
                    entry.fail(RpcError::Timeout);
                    let note = Notification::cancelled(
                        id.clone(),
                        Some(String::from("request timed out")),
                    );
                    if let Err(e) = transport.send(Message::Notification(note)) {
                        debug!(log, "could not tell peer about timeout";
                               "id" => %id, "err" => %e);
                    }
                }),
            );
        }

        debug!(self.log, "issuing call"; "id" => %id, "method" => method);
        let request = Message::request(id.clone(), method, params);
        if let Err(e) = self.transport.send(request) {
            error!(self.log, "failed to send request"; "id" => %id, "err" => %e);
            self.deadlines.cancel(&id);
            if let Some(entry) = self.pending.complete(&id) {
                entry.fail(RpcError::Transport(e.to_string()));
            }
        }
        id
    }

    /// Issue a call and wait for its outcome. Dropping the returned future
    /// before it completes cancels the call.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let err_tx = Arc::clone(&tx);

        let id = self.issue_call(
            method,
            params,
            move |value| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(value));
                }
            },
            move |err| {
                if let Some(tx) = err_tx.lock().take() {
                    let _ = tx.send(Err(err));
                }
            },
            timeout,
        );

        let mut guard = AbandonGuard {
            session: self,
            id,
            armed: true,
        };
        let outcome = rx.await.unwrap_or(Err(RpcError::Disconnected));
        guard.armed = false;
        outcome
    }

    /// Settle the call `id` with the peer's response. Responses for calls
    /// that already settled are ignored.
    pub fn on_response_arrived(
        &self,
        id: RequestId,
        outcome: Result<Value, ErrorObject>,
    ) {
        if let Some(entry) = self.pending.complete(&id) {
            self.deadlines.cancel(&id);
            entry.resolve(outcome.map_err(RpcError::Remote));
        }
    }

    /// Deliver a cancellation notification from the peer.
    ///
    /// The notification does not say whose identifier space `id` belongs
    /// to. Work serving a peer request under `id` takes it; otherwise it
    /// settles our own pending call `id`, if any. Unknown ids are ignored.
    pub fn on_cancellation_notification(&self, id: RequestId, reason: Option<String>) {
        if self.inbound.handle_cancelled(&id, reason.clone()) {
            return;
        }
        self.settle_cancelled(&id, reason);
    }

    /// Cancel one of our own calls and tell the peer to stop working on
    /// it. Returns false if the call had already settled.
    pub fn cancel_call(&self, id: &RequestId, reason: Option<String>) -> bool {
        if !self.settle_cancelled(id, reason.clone()) {
            return false;
        }
        let note = Notification::cancelled(id.clone(), reason);
        if let Err(e) = self.transport.send(Message::Notification(note)) {
            debug!(self.log, "could not send cancellation"; "id" => %id, "err" => %e);
        }
        true
    }

    fn settle_cancelled(&self, id: &RequestId, reason: Option<String>) -> bool {
        match self.pending.cancel(id) {
            Some(entry) => {
                self.deadlines.cancel(id);
                entry.fail(RpcError::Cancelled { reason });
                true
            }
            None => false,
        }
    }

    /// Register work serving the peer's request `id`. The returned handle
    /// fires if the peer cancels the request.
    pub fn begin_inbound(&self, id: RequestId) -> CancellationHandle {
        let handle = CancellationHandle::new();
        self.inbound.register_request(id, handle.clone());
        handle
    }

    /// Forget the peer request `id`, unless a later request reusing the
    /// same identifier has replaced `handle` in the meantime.
    pub fn finish_inbound(&self, id: &RequestId, handle: &CancellationHandle) {
        self.inbound.unregister_source(id, handle);
    }

    /// Route a classified inbound message. Responses and cancellation
    /// notifications are consumed; requests and any other notification
    /// are handed back to the caller.
    pub fn handle_message(&self, message: Message) -> Option<Message> {
        match message {
            Message::Response(response) => {
                self.on_response_arrived(response.id, response.outcome);
                None
            }
            Message::Notification(note) => match note.as_cancelled() {
                Some(params) => {
                    self.on_cancellation_notification(params.request_id, params.reason);
                    None
                }
                None => Some(Message::Notification(note)),
            },
            request => Some(request),
        }
    }

    /// Fail every call whose deadline has passed.
    pub fn check_timeouts(&self) -> Vec<RequestId> {
        self.deadlines.check_timeouts()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.registered_count()
    }

    /// Fail every outstanding call with `Disconnected` and signal all
    /// inbound work.
    pub fn close(&self) {
        for entry in self.pending.drain() {
            self.deadlines.cancel(&entry.id);
            entry.fail(RpcError::Disconnected);
        }
        let inbound = self
            .inbound
            .cancel_all(Some(String::from("connection closed")));
        debug!(self.log, "session closed"; "inbound_cancelled" => inbound);
    }

    /// Run `check_timeouts` (and the task ttl sweep, if an engine is given)
    /// on the configured cadence until the session is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        tasks: Option<Arc<TaskEngine>>,
    ) -> JoinHandle<()> {
        let weak: Weak<Session> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let session = match weak.upgrade() {
                    Some(session) => session,
                    None => break,
                };
                let expired = session.check_timeouts();
                if !expired.is_empty() {
                    debug!(session.log, "calls timed out"; "count" => expired.len());
                }
                if let Some(tasks) = &tasks {
                    tasks.cleanup_expired();
                }
            }
        })
    }
}

/// Cancels a call whose awaiting future was dropped before it settled.
struct AbandonGuard<'a> {
    session: &'a Session,
    id: RequestId,
    armed: bool,
}

impl<'a> Drop for AbandonGuard<'a> {
    fn drop(&mut self) {
        if self.armed {
            self.session
                .cancel_call(&self.id, Some(String::from("caller went away")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    use serde_json::json;

    use crate::protocol::{Request, CANCELLED_METHOD};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Message>>,
        refuse: bool,
    }

    impl Outbound for Recorder {
        fn send(&self, message: Message) -> io::Result<()> {
            if self.refuse {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            self.sent.lock().push(message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Outcomes {
        values: Mutex<Vec<Value>>,
        errors: Mutex<Vec<RpcError>>,
        fired: AtomicUsize,
    }

    fn session_with(recorder: &Arc<Recorder>, default_timeout_ms: Option<u64>) -> Session {
        let config = SessionConfig {
            default_timeout_ms,
            ..SessionConfig::default()
        };
        let transport: Arc<dyn Outbound> = Arc::clone(recorder) as Arc<dyn Outbound>;
        Session::new(config, transport, None)
    }

    fn issue(session: &Session, outcomes: &Arc<Outcomes>, timeout: Option<Duration>) -> RequestId {
        let ok = Arc::clone(outcomes);
        let err = Arc::clone(outcomes);
        session.issue_call(
            "work",
            Some(json!({"n": 1})),
            move |v| {
                ok.values.lock().push(v);
                ok.fired.fetch_add(1, Ordering::SeqCst);
            },
            move |e| {
                err.errors.lock().push(e);
                err.fired.fetch_add(1, Ordering::SeqCst);
            },
            timeout,
        )
    }

    #[test]
    fn config_loads_from_json_with_defaults() {
        let config: SessionConfig =
            serde_json::from_value(json!({ "sweep_interval_ms": 25 })).unwrap();
        assert_eq!(config.sweep_interval_ms, 25);
        assert_eq!(config.default_timeout_ms, Some(60_000));
    }

    #[test]
    fn response_settles_the_call_and_disarms_its_deadline() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, Some(10_000));
        let outcomes = Arc::new(Outcomes::default());
        let id = issue(&session, &outcomes, None);

        match &recorder.sent.lock()[0] {
            Message::Request(Request { id: sent, method, .. }) => {
                assert_eq!(sent, &id);
                assert_eq!(method, "work");
            }
            other => panic!("expected a request, got {:?}", other),
        }

        session.on_response_arrived(id.clone(), Ok(json!("done")));
        session.on_response_arrived(id.clone(), Ok(json!("again")));
        assert_eq!(*outcomes.values.lock(), vec![json!("done")]);
        assert_eq!(outcomes.fired.load(Ordering::SeqCst), 1);
        assert_eq!(session.pending_count(), 0);
        assert!(session.check_timeouts().is_empty());
    }

    #[test]
    fn error_responses_become_remote_errors() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, None);
        let outcomes = Arc::new(Outcomes::default());
        let id = issue(&session, &outcomes, None);

        let remote = ErrorObject::method_not_found("work");
        session.on_response_arrived(id, Err(remote.clone()));
        assert_eq!(*outcomes.errors.lock(), vec![RpcError::Remote(remote)]);
    }

    #[test]
    fn deadline_fails_the_call_and_notifies_the_peer() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, None);
        let outcomes = Arc::new(Outcomes::default());
        let id = issue(&session, &outcomes, Some(Duration::from_millis(0)));

        assert_eq!(session.check_timeouts(), vec![id.clone()]);
        session.on_response_arrived(id.clone(), Ok(json!("late")));

        assert_eq!(*outcomes.errors.lock(), vec![RpcError::Timeout]);
        assert_eq!(outcomes.fired.load(Ordering::SeqCst), 1);
        let sent = recorder.sent.lock();
        match sent.last() {
            Some(Message::Notification(n)) => {
                assert_eq!(n.method, CANCELLED_METHOD);
                assert_eq!(n.as_cancelled().unwrap().request_id, id);
            }
            other => panic!("expected a cancellation, got {:?}", other),
        }
    }

    #[test]
    fn peer_cancellation_fails_a_pending_call() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, Some(10_000));
        let outcomes = Arc::new(Outcomes::default());
        let id = issue(&session, &outcomes, None);

        session.on_cancellation_notification(id.clone(), Some(String::from("busy")));
        session.on_response_arrived(id, Ok(json!(1)));
        assert!(session.check_timeouts().is_empty());

        assert_eq!(
            *outcomes.errors.lock(),
            vec![RpcError::Cancelled {
                reason: Some(String::from("busy"))
            }]
        );
        assert_eq!(outcomes.fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_after_completion_changes_nothing() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, None);
        let outcomes = Arc::new(Outcomes::default());
        let id = issue(&session, &outcomes, None);
        session.on_response_arrived(id.clone(), Ok(json!(true)));
        let sent_before = recorder.sent.lock().len();

        session.on_cancellation_notification(id.clone(), None);
        assert!(!session.cancel_call(&id, None));

        assert_eq!(outcomes.fired.load(Ordering::SeqCst), 1);
        assert!(outcomes.errors.lock().is_empty());
        assert_eq!(recorder.sent.lock().len(), sent_before);
    }

    #[test]
    fn local_cancel_notifies_the_peer() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, None);
        let outcomes = Arc::new(Outcomes::default());
        let id = issue(&session, &outcomes, None);

        assert!(session.cancel_call(&id, Some(String::from("user"))));
        match recorder.sent.lock().last() {
            Some(Message::Notification(n)) => {
                let params = n.as_cancelled().unwrap();
                assert_eq!(params.request_id, id);
                assert_eq!(params.reason.as_deref(), Some("user"));
            }
            other => panic!("expected a cancellation, got {:?}", other),
        }
        assert_eq!(outcomes.fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refused_send_fails_the_call_once() {
        let recorder = Arc::new(Recorder {
            refuse: true,
            ..Recorder::default()
        });
        let session = session_with(&recorder, Some(10));
        let outcomes = Arc::new(Outcomes::default());
        issue(&session, &outcomes, None);

        assert_eq!(outcomes.fired.load(Ordering::SeqCst), 1);
        assert!(matches!(outcomes.errors.lock()[0], RpcError::Transport(_)));
        assert_eq!(session.pending_count(), 0);
        thread::sleep(Duration::from_millis(15));
        assert!(session.check_timeouts().is_empty());
    }

    #[test]
    fn inbound_work_sees_peer_cancellation() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, None);
        let peer_id = RequestId::from("peer-7");

        let handle = session.begin_inbound(peer_id.clone());
        assert_eq!(session.inbound_count(), 1);
        let leftover = session.handle_message(Message::Notification(Notification::cancelled(
            peer_id.clone(),
            Some(String::from("stop")),
        )));
        assert!(leftover.is_none());
        assert!(handle.is_cancelled());
        assert_eq!(handle.reason().as_deref(), Some("stop"));
        assert_eq!(session.inbound_count(), 0);
        session.finish_inbound(&peer_id, &handle);
    }

    #[test]
    fn peer_cancellation_prefers_the_peer_request() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, None);
        let outcomes = Arc::new(Outcomes::default());

        let handle = session.begin_inbound(RequestId::Number(1));
        let ours = issue(&session, &outcomes, None);
        assert_eq!(ours, RequestId::Number(1));

        session.on_cancellation_notification(
            RequestId::Number(1),
            Some(String::from("peer gave up")),
        );
        assert!(handle.is_cancelled());
        assert_eq!(session.inbound_count(), 0);
        assert_eq!(session.pending_count(), 1);
        assert_eq!(outcomes.fired.load(Ordering::SeqCst), 0);

        session.on_response_arrived(ours, Ok(json!("still ours")));
        assert_eq!(*outcomes.values.lock(), vec![json!("still ours")]);
        assert!(outcomes.errors.lock().is_empty());
    }

    #[test]
    fn reused_peer_id_keeps_the_newer_request_cancellable() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, None);
        let id = RequestId::from("dup");

        let first = session.begin_inbound(id.clone());
        let second = session.begin_inbound(id.clone());
        session.finish_inbound(&id, &first);
        assert_eq!(session.inbound_count(), 1);

        session.on_cancellation_notification(id.clone(), None);
        assert!(second.is_cancelled());
        assert!(!first.is_cancelled());
        session.finish_inbound(&id, &second);
        assert_eq!(session.inbound_count(), 0);
    }

    #[test]
    fn timed_out_calls_leave_nothing_behind() {
        let recorder = Arc::new(Recorder::default());
        let session = Arc::new(session_with(&recorder, None));
        let outcomes = Arc::new(Outcomes::default());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let sweeper = {
            let session = Arc::clone(&session);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    session.check_timeouts();
                }
            })
        };
        for _ in 0..2_000 {
            issue(&session, &outcomes, Some(Duration::from_millis(0)));
        }
        done.store(true, Ordering::SeqCst);
        sweeper.join().unwrap();
        session.check_timeouts();

        assert_eq!(outcomes.fired.load(Ordering::SeqCst), 2_000);
        assert_eq!(session.pending_count(), 0);
        assert!(session.check_timeouts().is_empty());
        assert_eq!(session.inbound_count(), 0);
    }

    #[test]
    fn handle_message_passes_requests_through() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, None);
        let req = Message::request(RequestId::Number(1), "echo", None);
        assert_eq!(session.handle_message(req.clone()), Some(req));
        let note = Message::notification("notifications/progress", None);
        assert_eq!(session.handle_message(note.clone()), Some(note));
    }

    #[test]
    fn close_fails_everything_outstanding() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, Some(10_000));
        let outcomes = Arc::new(Outcomes::default());
        for _ in 0..3 {
            issue(&session, &outcomes, None);
        }
        session.close();
        assert_eq!(session.pending_count(), 0);
        assert_eq!(*outcomes.errors.lock(), vec![RpcError::Disconnected; 3]);
    }

    #[test]
    fn racing_paths_settle_each_call_once() {
        let recorder = Arc::new(Recorder::default());
        let session = Arc::new(session_with(&recorder, None));
        for _ in 0..100 {
            let outcomes = Arc::new(Outcomes::default());
            let id = issue(&session, &outcomes, Some(Duration::from_millis(0)));
            let barrier = Arc::new(Barrier::new(3));

            let mut handles = Vec::new();
            for path in 0..3 {
                let session = Arc::clone(&session);
                let barrier = Arc::clone(&barrier);
                let id = id.clone();
                handles.push(thread::spawn(move || {
                    barrier.wait();
                    match path {
                        0 => session.on_response_arrived(id, Ok(json!(0))),
                        1 => {
                            session.check_timeouts();
                        }
                        _ => session.on_cancellation_notification(id, None),
                    }
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(outcomes.fired.load(Ordering::SeqCst), 1);
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_resolves_through_the_callbacks() {
        let recorder = Arc::new(Recorder::default());
        let session = Arc::new(session_with(&recorder, None));

        let caller = Arc::clone(&session);
        let call = tokio::spawn(async move { caller.call("work", None, None).await });
        while session.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        session.on_response_arrived(RequestId::Number(1), Ok(json!({"ok": true})));

        assert_eq!(call.await.unwrap(), Ok(json!({"ok": true})));
    }

    #[tokio::test]
    async fn dropped_call_is_cancelled() {
        let recorder = Arc::new(Recorder::default());
        let session = session_with(&recorder, None);

        let attempt = tokio::time::timeout(
            Duration::from_millis(10),
            session.call("slow", None, None),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(session.pending_count(), 0);
        assert!(matches!(
            recorder.sent.lock().last(),
            Some(Message::Notification(_))
        ));
    }

    #[tokio::test]
    async fn sweeper_times_out_calls() {
        let recorder = Arc::new(Recorder::default());
        let session = Arc::new(Session::new(
            SessionConfig {
                default_timeout_ms: None,
                sweep_interval_ms: 5,
            },
            Arc::clone(&recorder) as Arc<dyn Outbound>,
            None,
        ));
        let sweeper = session.spawn_sweeper(None);

        let outcome = session
            .call("slow", None, Some(Duration::from_millis(20)))
            .await;
        assert_eq!(outcome, Err(RpcError::Timeout));
        sweeper.abort();
    }
}
