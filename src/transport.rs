// Copyright 2020 Joyent, Inc.

//! Plumbing between a `Session` and a framed byte stream.

use std::io;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::protocol::{JsonRpcCodec, Message};
use crate::session::{Outbound, Session};

/// Queues outbound messages for a connection's writer task.
#[derive(Debug, Clone)]
pub struct ChannelOutbound {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelOutbound {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        ChannelOutbound { tx }
    }
}

impl Outbound for ChannelOutbound {
    fn send(&self, message: Message) -> io::Result<()> {
        self.tx.send(message).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "connection writer has exited")
        })
    }
}

/// Write queued messages to `stream` until every sender is gone or the
/// stream fails.
pub async fn write_loop<W>(
    stream: W,
    mut rx: mpsc::UnboundedReceiver<Message>,
    log: Logger,
) where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(stream, JsonRpcCodec);
    while let Some(msg) = rx.recv().await {
        if let Err(e) = framed.send(msg).await {
            error!(log, "failed to write message"; "err" => %e);
            break;
        }
    }
    rx.close();
    debug!(log, "writer finished");
}

/// Read messages from `stream`, feeding responses and cancellations to
/// `session` and everything else to `unhandled`. Returns when the stream
/// ends or yields an undecodable frame.
pub async fn read_loop<R, F>(
    stream: R,
    session: &Session,
    log: &Logger,
    mut unhandled: F,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Message),
{
    let mut framed = FramedRead::new(stream, JsonRpcCodec);
    while let Some(next) = framed.next().await {
        match next {
            Ok(msg) => {
                if let Some(msg) = session.handle_message(msg) {
                    unhandled(msg);
                }
            }
            Err(e) => {
                error!(log, "failed to read message"; "err" => %e);
                return Err(e);
            }
        }
    }
    Ok(())
}
