// Copyright 2020 Joyent, Inc.

//! fast-jsonrpc: request lifecycle and durable tasks for JSON-RPC over byte
//! streams
//!
//! The crate correlates outbound JSON-RPC calls with their responses and
//! settles every call exactly once, whether it completes, times out, or is
//! cancelled from either side. Alongside that it keeps a store of durable
//! tasks for work that outlives a single request.
//!
//! Components
//!
//! * `id`       Request identifiers and the generator for outbound calls.
//!
//! * `pending`  The pending-request table: id -> (on_success, on_error).
//!              Removal is atomic, so of several racing completions only one
//!              ever sees the callbacks.
//!
//! * `deadline` Poll-driven deadlines. `check_timeouts` is called on a fixed
//!              cadence rather than arming one timer per request.
//!
//! * `cancel`   Cancellation signals keyed by request id, for delivering a
//!              peer's `notifications/cancelled` to whoever owns the work.
//!
//! * `task`     The task engine: status state machine, ttl sweep, stored
//!              results and cursor pagination.
//!
//! * `session`  Composes the above into the per-connection call lifecycle.
//!
//! * `protocol` JSON-RPC 2.0 messages and the frame codec.
//!
//! * `client`, `server`, `transport`  Driving a `Session` over TCP.
//!
//! Frames: each message travels as a 10-byte header followed by its JSON
//! encoding.
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * TYPE      1-byte integer.  The only supported value is TYPE_JSON (0x1).
//!
//! * CRC1...CRC4      4-byte big-endian CRC16 of the payload
//!
//! * DLEN1...DLEN4    4-byte big-endian payload length
//!
//! Request IDs: ids generated locally are integers allocated sequentially
//! from 1 and are scoped to the connection.

#![allow(missing_docs)]

pub mod cancel;
pub mod client;
pub mod deadline;
pub mod error;
pub mod id;
pub mod pending;
pub mod protocol;
pub mod server;
pub mod session;
pub mod task;
pub mod transport;

pub use crate::error::RpcError;
pub use crate::id::RequestId;
pub use crate::session::{Session, SessionConfig};
pub use crate::task::{TaskEngine, TaskEngineConfig, TaskStatus};
