// Copyright 2020 Joyent, Inc.

//! Calling a JSON-RPC peer over TCP.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use slog::{debug, o, Drain, Logger};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::RpcError;
use crate::id::RequestId;
use crate::protocol::{ErrorObject, Message};
use crate::session::{Outbound, Session, SessionConfig};
use crate::transport::{read_loop, write_loop, ChannelOutbound};

const WRITER_GRACE: Duration = Duration::from_millis(500);

/// A connected client. Calls made through it are settled by responses read
/// on a background task; the session's sweeper enforces their deadlines.
pub struct Client {
    session: Arc<Session>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

pub async fn connect(
    addr: &SocketAddr,
    config: SessionConfig,
    log: Option<&Logger>,
) -> Result<Client, io::Error> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Client::from_stream(stream, config, log))
}

impl Client {
    pub fn from_stream(
        stream: TcpStream,
        config: SessionConfig,
        log: Option<&Logger>,
    ) -> Client {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write, rx, log.clone()));
        let outbound = ChannelOutbound::new(tx);

        let session = Arc::new(Session::new(
            config,
            Arc::new(outbound.clone()),
            Some(&log),
        ));
        let sweeper = session.spawn_sweeper(None);

        let reader_session = Arc::clone(&session);
        let reader = tokio::spawn(async move {
            let _ = read_loop(read, &reader_session, &log, |msg| match msg {
                Message::Request(request) => {
                    // Clients expose no methods of their own.
                    let reply = Message::error(
                        request.id,
                        ErrorObject::method_not_found(&request.method),
                    );
                    if let Err(e) = outbound.send(reply) {
                        debug!(log, "could not reject request"; "err" => %e);
                    }
                }
                other => debug!(log, "ignoring message"; "message" => ?other),
            })
            .await;
            reader_session.close();
        });

        Client {
            session,
            reader,
            writer,
            sweeper,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        self.session.call(method, params, timeout).await
    }

    pub fn cancel_call(&self, id: &RequestId, reason: Option<String>) -> bool {
        self.session.cancel_call(id, reason)
    }

    /// Fail anything still outstanding and tear the connection down.
    ///
    /// The writer flushes what is already queued, but clones of
    /// `session()` held elsewhere keep its channel open, so it is aborted
    /// after `WRITER_GRACE`.
    pub async fn shutdown(self) {
        let Client {
            session,
            reader,
            mut writer,
            sweeper,
        } = self;
        reader.abort();
        sweeper.abort();
        session.close();
        let _ = reader.await;
        drop(session);
        if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
    }
}
