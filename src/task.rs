// Copyright 2020 Joyent, Inc.

//! Durable tasks: operations that outlive a single request/response
//! exchange.
//!
//! A task is created in `Working` and moves through a fixed status graph:
//!
//! ```text
//!   Working <-----> InputRequired
//!      |                 |
//!      +--> Completed <--+
//!      +--> Failed    <--+
//!      +--> Cancelled <--+
//! ```
//!
//! The three terminal states have no outgoing edges. Tasks live in memory
//! until deleted or swept by `cleanup_expired` once older than their ttl.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use slog::{debug, info, o, warn, Drain, Logger};
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Working,
    InputRequired,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => true,
            TaskStatus::Working | TaskStatus::InputRequired => false,
        }
    }

    /// Whether the status graph has an edge from `self` to `next`.
    /// Non-terminal states may re-assert themselves to refresh the status
    /// message.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Working, Working)
            | (Working, InputRequired)
            | (Working, Completed)
            | (Working, Failed)
            | (Working, Cancelled) => true,
            (InputRequired, InputRequired)
            | (InputRequired, Working)
            | (InputRequired, Completed)
            | (InputRequired, Failed)
            | (InputRequired, Cancelled) => true,
            (Completed, _) | (Failed, _) | (Cancelled, _) => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TaskStatus::Working => "working",
            TaskStatus::InputRequired => "input_required",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("cannot move task from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("invalid pagination cursor")]
    InvalidCursor,
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_u64(d.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    #[serde(default, with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<Duration>,
}

impl Task {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age = (now - self.created_at).to_std().unwrap_or_default();
                age > ttl
            }
            None => false,
        }
    }
}

/// One page of a task listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// How task ids are minted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskIdStrategy {
    /// 128 random bits, hex encoded.
    Random,
    /// `<prefix>1`, `<prefix>2`, ...
    Sequential { prefix: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskEngineConfig {
    pub page_size: usize,
    pub id_strategy: TaskIdStrategy,
    /// Poll interval suggested to clients when a task is created without
    /// one.
    pub default_poll_interval_ms: Option<u64>,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        TaskEngineConfig {
            page_size: DEFAULT_PAGE_SIZE,
            id_strategy: TaskIdStrategy::Random,
            default_poll_interval_ms: None,
        }
    }
}

pub struct TaskEngine {
    tasks: Mutex<BTreeMap<String, Task>>,
    results: Mutex<HashMap<String, Value>>,
    config: TaskEngineConfig,
    sequence: AtomicU64,
    log: Logger,
}

impl TaskEngine {
    pub fn new(config: TaskEngineConfig, log: Option<&Logger>) -> Self {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        TaskEngine {
            tasks: Mutex::new(BTreeMap::new()),
            results: Mutex::new(HashMap::new()),
            config: TaskEngineConfig {
                page_size: config.page_size.max(1),
                ..config
            },
            sequence: AtomicU64::new(1),
            log,
        }
    }

    fn mint_id(&self, tasks: &BTreeMap<String, Task>) -> String {
        loop {
            let id = match &self.config.id_strategy {
                TaskIdStrategy::Random => {
                    format!("{:032x}", rand::random::<u128>())
                }
                TaskIdStrategy::Sequential { prefix } => format!(
                    "{}{}",
                    prefix,
                    self.sequence.fetch_add(1, Ordering::Relaxed)
                ),
            };
            if !tasks.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn create_task(
        &self,
        ttl: Option<Duration>,
        poll_interval: Option<Duration>,
    ) -> String {
        let now = Utc::now();
        let poll_interval = poll_interval.or_else(|| {
            self.config.default_poll_interval_ms.map(Duration::from_millis)
        });

        let mut tasks = self.tasks.lock();
        let task_id = self.mint_id(&tasks);
        tasks.insert(
            task_id.clone(),
            Task {
                task_id: task_id.clone(),
                status: TaskStatus::Working,
                status_message: None,
                created_at: now,
                last_updated_at: now,
                ttl,
                poll_interval,
            },
        );
        debug!(self.log, "task created"; "task_id" => &task_id);
        task_id
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().get(task_id).cloned()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Move a task to `status`, validating the edge first. A rejected
    /// transition leaves the task untouched.
    pub fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(String::from(task_id)))?;

        if !task.status.can_transition_to(status) {
            warn!(self.log, "rejected task status change";
                  "task_id" => task_id,
                  "from" => %task.status,
                  "to" => %status);
            return Err(TaskError::InvalidTransition {
                from: task.status,
                to: status,
            });
        }

        task.status = status;
        task.status_message = message;
        task.last_updated_at = Utc::now();
        debug!(self.log, "task status changed";
               "task_id" => task_id, "status" => %status);
        Ok(task.clone())
    }

    pub fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: Option<String>,
    ) -> bool {
        self.transition(task_id, status, message).is_ok()
    }

    pub fn cancel(&self, task_id: &str) -> Result<Task, TaskError> {
        self.transition(task_id, TaskStatus::Cancelled, None)
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.cancel(task_id).is_ok()
    }

    /// Store the result for a task. Independent of status; returns false
    /// only when the task does not exist.
    pub fn set_result(&self, task_id: &str, result: Value) -> bool {
        let tasks = self.tasks.lock();
        if !tasks.contains_key(task_id) {
            return false;
        }
        self.results.lock().insert(String::from(task_id), result);
        true
    }

    pub fn get_result(&self, task_id: &str) -> Option<Value> {
        self.results.lock().get(task_id).cloned()
    }

    /// Remove a task and its result regardless of status.
    pub fn delete_task(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.lock();
        let removed = tasks.remove(task_id).is_some();
        self.results.lock().remove(task_id);
        removed
    }

    /// One page of tasks in task id order. `cursor` is the `next_cursor`
    /// of the previous page.
    pub fn list_tasks(&self, cursor: Option<&str>) -> Result<TaskPage, TaskError> {
        let lower = match cursor {
            Some(c) => Bound::Excluded(decode_cursor(c)?),
            None => Bound::Unbounded,
        };

        let tasks = self.tasks.lock();
        let mut range = tasks.range::<String, _>((lower, Bound::Unbounded));
        let page: Vec<Task> = range
            .by_ref()
            .take(self.config.page_size)
            .map(|(_, t)| t.clone())
            .collect();
        let next_cursor = match (range.next(), page.last()) {
            (Some(_), Some(last)) => Some(encode_cursor(&last.task_id)),
            _ => None,
        };

        Ok(TaskPage {
            tasks: page,
            next_cursor,
        })
    }

    /// Remove every task older than its ttl, along with its result.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut tasks = self.tasks.lock();
        let expired: Vec<String> = tasks
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| t.task_id.clone())
            .collect();

        let mut results = self.results.lock();
        for id in &expired {
            tasks.remove(id);
            results.remove(id);
        }
        if !expired.is_empty() {
            info!(self.log, "expired tasks removed"; "count" => expired.len());
        }
        expired.len()
    }
}

fn encode_cursor(task_id: &str) -> String {
    task_id.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_cursor(cursor: &str) -> Result<String, TaskError> {
    if cursor.len() % 2 != 0 || !cursor.is_ascii() {
        return Err(TaskError::InvalidCursor);
    }
    let bytes = (0..cursor.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&cursor[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| TaskError::InvalidCursor)?;
    String::from_utf8(bytes).map_err(|_| TaskError::InvalidCursor)
}
