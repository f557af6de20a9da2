// Copyright 2020 Joyent, Inc.

//! Serving JSON-RPC requests on one connection.
//!
//! Each inbound request runs as its own tokio task under a cancellation
//! handle registered with the connection's `Session`. If the peer cancels
//! the request, the handler future is dropped and no response is written.
//! Methods under `tasks/` are answered directly from a `TaskEngine` when
//! one is supplied.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::Value;
use slog::{debug, info, o, Drain, Logger};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::cancel::CancellationHandle;
use crate::protocol::{ErrorObject, Message, Request, Response};
use crate::session::{Outbound, Session, SessionConfig};
use crate::task::{TaskEngine, TaskError};
use crate::transport::{read_loop, write_loop, ChannelOutbound};

pub const TASKS_CREATE: &str = "tasks/create";
pub const TASKS_GET: &str = "tasks/get";
pub const TASKS_LIST: &str = "tasks/list";
pub const TASKS_CANCEL: &str = "tasks/cancel";
pub const TASKS_RESULT: &str = "tasks/result";

/// Application logic for requests that are not task methods.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: Request,
        cancel: CancellationHandle,
        log: Logger,
    ) -> BoxFuture<'static, Result<Value, ErrorObject>>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Request, CancellationHandle, Logger) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorObject>> + Send + 'static,
{
    fn handle(
        &self,
        request: Request,
        cancel: CancellationHandle,
        log: Logger,
    ) -> BoxFuture<'static, Result<Value, ErrorObject>> {
        self(request, cancel, log).boxed()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdParams {
    task_id: String,
}

#[derive(Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    #[serde(default)]
    ttl: Option<u64>,
    #[serde(default)]
    poll_interval: Option<u64>,
}

fn parse_params<T: DeserializeOwned>(params: &Option<Value>) -> Result<T, ErrorObject> {
    let value = params.clone().unwrap_or(Value::Object(Default::default()));
    serde_json::from_value(value)
        .map_err(|e| ErrorObject::invalid_params(format!("invalid params: {}", e)))
}

fn task_error(err: TaskError) -> ErrorObject {
    ErrorObject::invalid_params(err.to_string())
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<Value, ErrorObject> {
    serde_json::to_value(v).map_err(|e| ErrorObject::internal(e.to_string()))
}

/// The task surface as remote methods.
pub struct TaskMethods {
    engine: Arc<TaskEngine>,
}

impl TaskMethods {
    pub fn new(engine: Arc<TaskEngine>) -> Self {
        TaskMethods { engine }
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    /// Answer `request` if it names a task method, otherwise `None`.
    pub fn dispatch(&self, request: &Request) -> Option<Result<Value, ErrorObject>> {
        let outcome = match request.method.as_str() {
            TASKS_CREATE => self.create(&request.params),
            TASKS_GET => self.get(&request.params),
            TASKS_LIST => self.list(&request.params),
            TASKS_CANCEL => self.cancel(&request.params),
            TASKS_RESULT => self.result(&request.params),
            _ => return None,
        };
        Some(outcome)
    }

    fn create(&self, params: &Option<Value>) -> Result<Value, ErrorObject> {
        let p: CreateParams = parse_params(params)?;
        let id = self.engine.create_task(
            p.ttl.map(Duration::from_millis),
            p.poll_interval.map(Duration::from_millis),
        );
        self.get_by_id(&id)
    }

    fn get(&self, params: &Option<Value>) -> Result<Value, ErrorObject> {
        let p: TaskIdParams = parse_params(params)?;
        self.get_by_id(&p.task_id)
    }

    fn get_by_id(&self, task_id: &str) -> Result<Value, ErrorObject> {
        let task = self
            .engine
            .get_task(task_id)
            .ok_or_else(|| task_error(TaskError::NotFound(String::from(task_id))))?;
        to_value(&task)
    }

    fn list(&self, params: &Option<Value>) -> Result<Value, ErrorObject> {
        let p: ListParams = parse_params(params)?;
        let page = self
            .engine
            .list_tasks(p.cursor.as_deref())
            .map_err(task_error)?;
        to_value(&page)
    }

    fn cancel(&self, params: &Option<Value>) -> Result<Value, ErrorObject> {
        let p: TaskIdParams = parse_params(params)?;
        let task = self.engine.cancel(&p.task_id).map_err(task_error)?;
        to_value(&task)
    }

    fn result(&self, params: &Option<Value>) -> Result<Value, ErrorObject> {
        let p: TaskIdParams = parse_params(params)?;
        let task = self
            .engine
            .get_task(&p.task_id)
            .ok_or_else(|| task_error(TaskError::NotFound(p.task_id.clone())))?;
        match self.engine.get_result(&p.task_id) {
            Some(result) => Ok(result),
            None if task.status.is_terminal() => Ok(Value::Null),
            None => Err(ErrorObject::invalid_params(format!(
                "task {} is still {}",
                p.task_id, task.status
            ))),
        }
    }
}

fn dispatch<H: RequestHandler>(
    request: Request,
    session: &Arc<Session>,
    handler: &Arc<H>,
    tasks: &Option<Arc<TaskMethods>>,
    outbound: &ChannelOutbound,
    log: &Logger,
) {
    let id = request.id.clone();
    debug!(log, "handling request"; "id" => %id, "method" => &request.method);

    if let Some(outcome) = tasks.as_ref().and_then(|t| t.dispatch(&request)) {
        let response = Message::Response(Response { id, outcome });
        if let Err(e) = outbound.send(response) {
            debug!(log, "could not send response"; "err" => %e);
        }
        return;
    }

    let cancel = session.begin_inbound(id.clone());
    let work = handler.handle(request, cancel.clone(), log.clone());
    let session = Arc::clone(session);
    let outbound = outbound.clone();
    let log = log.clone();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            outcome = work => Some(outcome),
            _ = cancel.cancelled() => None,
        };
        session.finish_inbound(&id, &cancel);
        match outcome {
            Some(outcome) => {
                let response = Message::Response(Response {
                    id: id.clone(),
                    outcome,
                });
                if let Err(e) = outbound.send(response) {
                    debug!(log, "could not send response"; "id" => %id, "err" => %e);
                }
            }
            None => {
                debug!(log, "request cancelled by peer"; "id" => %id,
                       "reason" => cancel.reason().unwrap_or_default());
            }
        }
    });
}

/// Build the future that serves one connection until the peer hangs up.
pub fn make_task<H>(
    socket: TcpStream,
    handler: H,
    tasks: Option<Arc<TaskEngine>>,
    config: SessionConfig,
    log: Option<&Logger>,
) -> impl Future<Output = ()> + Send
where
    H: RequestHandler,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    let handler = Arc::new(handler);

    async move {
        let peer = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| String::from("unknown"));
        let conn_log = log.new(o!("peer" => peer));
        info!(conn_log, "connection accepted");

        let (read, write) = socket.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write, rx, conn_log.clone()));
        let outbound = ChannelOutbound::new(tx);

        let session = Arc::new(Session::new(
            config,
            Arc::new(outbound.clone()),
            Some(&conn_log),
        ));
        let sweeper = session.spawn_sweeper(tasks.clone());
        let tasks = tasks.map(|engine| Arc::new(TaskMethods::new(engine)));

        let result = read_loop(read, &session, &conn_log, |msg| match msg {
            Message::Request(request) => dispatch(
                request, &session, &handler, &tasks, &outbound, &conn_log,
            ),
            other => debug!(conn_log, "ignoring message"; "message" => ?other),
        })
        .await;

        sweeper.abort();
        session.close();
        drop(session);
        drop(outbound);
        let _ = writer.await;

        match result {
            Ok(()) => info!(conn_log, "connection closed"),
            Err(e) => info!(conn_log, "connection closed"; "err" => %e),
        }
    }
}
