// Copyright 2020 Joyent, Inc.

//! Poll-driven request deadlines.
//!
//! Deadlines are not backed by individual timers. A scheduler calls
//! `check_timeouts` on a fixed cadence and every expiry decision is made
//! there.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slog::{debug, o, Drain, Logger};

use crate::id::RequestId;

pub type TimeoutCallback = Box<dyn FnOnce(RequestId) + Send>;

struct Deadline {
    expiry: Instant,
    on_timeout: TimeoutCallback,
}

pub struct DeadlineTracker {
    entries: Mutex<HashMap<RequestId, Deadline>>,
    log: Logger,
}

impl DeadlineTracker {
    pub fn new(log: Option<&Logger>) -> Self {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        DeadlineTracker {
            entries: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Arm (or re-arm) the deadline for `id`. Re-arming drops the previous
    /// callback without calling it.
    pub fn set_timeout(
        &self,
        id: RequestId,
        duration: Duration,
        on_timeout: TimeoutCallback,
    ) {
        let deadline = Deadline {
            expiry: Instant::now() + duration,
            on_timeout,
        };
        self.entries.lock().insert(id, deadline);
    }

    /// Disarm the deadline for `id` without calling its callback.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    pub fn has_timeout(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Earliest armed expiry, if any deadline is armed.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.lock().values().map(|d| d.expiry).min()
    }

    pub fn check_timeouts(&self) -> Vec<RequestId> {
        self.check_timeouts_at(Instant::now())
    }

    /// Remove every deadline at or before `now` and fire its callback.
    ///
    /// Callbacks run after the lock is released, so they may arm or cancel
    /// deadlines themselves.
    pub fn check_timeouts_at(&self, now: Instant) -> Vec<RequestId> {
        let expired: Vec<(RequestId, Deadline)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, d)| d.expiry <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|d| (id, d)))
                .collect()
        };

        let mut fired = Vec::with_capacity(expired.len());
        for (id, deadline) in expired {
            debug!(self.log, "request deadline passed"; "id" => %id);
            (deadline.on_timeout)(id.clone());
            fired.push(id);
        }
        fired
    }
}
