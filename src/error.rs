// Copyright 2020 Joyent, Inc.

use thiserror::Error;

use crate::protocol::{ErrorObject, REQUEST_CANCELLED, REQUEST_TIMEOUT};

/// The error handed to a call's error callback.
///
/// Every variant is delivered through a single callback invocation; none of
/// them escape as a panic or an unhandled fault.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// The call's deadline passed before a response arrived.
    #[error("request timed out")]
    Timeout,
    /// The call was cancelled while still pending.
    #[error("request cancelled{}", reason_suffix(.reason))]
    Cancelled { reason: Option<String> },
    /// The peer answered with an error response.
    #[error("remote error: {0}")]
    Remote(ErrorObject),
    /// The request could not be handed to the transport.
    #[error("transport error: {0}")]
    Transport(String),
    /// The session closed while the call was outstanding.
    #[error("connection closed before a response arrived")]
    Disconnected,
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(": {}", r),
        None => String::new(),
    }
}

impl RpcError {
    /// Render as a JSON-RPC error object, for reporting a local failure to
    /// a peer.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            RpcError::Remote(e) => e.clone(),
            RpcError::Timeout => {
                ErrorObject::new(REQUEST_TIMEOUT, self.to_string())
            }
            RpcError::Cancelled { .. } => {
                ErrorObject::new(REQUEST_CANCELLED, self.to_string())
            }
            RpcError::Transport(_) | RpcError::Disconnected => {
                ErrorObject::internal(self.to_string())
            }
        }
    }
}
