// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::prelude::*;
use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use fast_jsonrpc::cancel::CancellationHandle;
use fast_jsonrpc::protocol::{ErrorObject, Request};
use fast_jsonrpc::server;
use fast_jsonrpc::task::{TaskEngine, TaskEngineConfig, TaskStatus};
use fast_jsonrpc::SessionConfig;

static APP: &'static str = "rpcserve";
static DEFAULT_ADDR: &'static str = "127.0.0.1:2030";

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: u64,
    iso8601: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct JobPayload {
    steps: u32,
    step_ms: u64,
    ttl_ms: Option<u64>,
}

impl DatePayload {
    fn new() -> DatePayload {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        DatePayload {
            timestamp: now.as_secs() * 1_000 + u64::from(now.subsec_millis()),
            iso8601: Utc::now(),
        }
    }
}

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("JSON-RPC server with durable background jobs")
        .version(crate_version!())
        .arg(
            Arg::with_name("listen")
                .help("Address to listen on (Default: 127.0.0.1:2030)")
                .long("listen")
                .short("l")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Default deadline in milliseconds for calls this server issues")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .get_matches()
}

fn date_handler(log: &Logger) -> Result<Value, ErrorObject> {
    debug!(log, "handling date function request");
    serde_json::to_value(DatePayload::new())
        .map_err(|e| ErrorObject::internal(e.to_string()))
}

async fn sleep_handler(
    req: &Request,
    cancel: CancellationHandle,
    log: &Logger,
) -> Result<Value, ErrorObject> {
    let ms = req
        .params
        .as_ref()
        .and_then(|p| p["ms"].as_u64())
        .ok_or_else(|| ErrorObject::invalid_params("expected {\"ms\": <number>}"))?;
    debug!(log, "sleeping"; "ms" => ms);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept": ms })),
        _ = cancel.cancelled() => Err(ErrorObject::internal("cancelled")),
    }
}

/// Start a task that advances through `steps` steps in the background and
/// return it immediately.
fn job_handler(
    req: &Request,
    tasks: &Arc<TaskEngine>,
    log: &Logger,
) -> Result<Value, ErrorObject> {
    let payload: JobPayload = req
        .params
        .clone()
        .ok_or_else(|| ErrorObject::invalid_params("missing params"))
        .and_then(|p| {
            serde_json::from_value(p)
                .map_err(|e| ErrorObject::invalid_params(e.to_string()))
        })?;

    let task_id = tasks.create_task(
        payload.ttl_ms.map(Duration::from_millis),
        Some(Duration::from_millis(payload.step_ms)),
    );
    let task = tasks.get_task(&task_id);
    info!(log, "job started"; "task_id" => &task_id, "steps" => payload.steps);

    let tasks = Arc::clone(tasks);
    let log = log.clone();
    tokio::spawn(async move {
        for step in 1..=payload.steps {
            tokio::time::sleep(Duration::from_millis(payload.step_ms)).await;
            let msg = format!("step {} of {}", step, payload.steps);
            if !tasks.update_status(&task_id, TaskStatus::Working, Some(msg)) {
                info!(log, "job stopped"; "task_id" => &task_id);
                return;
            }
        }
        tasks.set_result(&task_id, json!({ "steps": payload.steps }));
        if !tasks.update_status(&task_id, TaskStatus::Completed, Some(String::from("done"))) {
            debug!(log, "job finished after being stopped"; "task_id" => &task_id);
        }
    });

    serde_json::to_value(task).map_err(|e| ErrorObject::internal(e.to_string()))
}

async fn msg_handler(
    req: Request,
    cancel: CancellationHandle,
    log: Logger,
    tasks: Arc<TaskEngine>,
) -> Result<Value, ErrorObject> {
    match req.method.as_str() {
        "date" => date_handler(&log),
        "echo" => Ok(req.params.unwrap_or(Value::Null)),
        "sleep" => sleep_handler(&req, cancel, &log).await,
        "jobs/start" => job_handler(&req, &tasks, &log),
        _ => Err(ErrorObject::method_not_found(&req.method)),
    }
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let matches = parse_opts(APP.to_string());
    let addr = matches
        .value_of("listen")
        .unwrap_or(DEFAULT_ADDR)
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse listen address: {}", e);
            process::exit(1)
        });
    let mut config = SessionConfig::default();
    if let Ok(ms) = value_t!(matches, "timeout", u64) {
        config.default_timeout_ms = Some(ms);
    }

    let tasks = Arc::new(TaskEngine::new(TaskEngineConfig::default(), Some(&root_log)));

    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", addr, e);
        process::exit(1)
    });
    info!(root_log, "listening for requests"; "address" => addr);

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let handler_tasks = Arc::clone(&tasks);
                let handler = move |req: Request, cancel: CancellationHandle, log: Logger| {
                    msg_handler(req, cancel, log, Arc::clone(&handler_tasks))
                };
                tokio::spawn(server::make_task(
                    socket,
                    handler,
                    Some(Arc::clone(&tasks)),
                    config.clone(),
                    Some(&root_log),
                ));
            }
            Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
        }
    }
}
