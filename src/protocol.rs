// Copyright 2020 Joyent, Inc.

//! JSON-RPC 2.0 messages and the frame codec that carries them over a byte
//! stream.
//!
//! Frame layout:
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * TYPE      1-byte integer.  The only supported value is TYPE_JSON (0x1),
//!             indicating that the payload is an encoded JSON-RPC message.
//!
//! * CRC1...CRC4    4-byte big-endian unsigned integer holding the CRC16 of
//!                  the payload
//!
//! * DLEN1...DLEN4  4-byte big-endian unsigned integer holding the number of
//!                  payload bytes that follow
//!
//! * DATA0...DATAN  Payload.  A single JSON-RPC request, response or
//!                  notification object.

use std::fmt;
use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use crc16::{State, ARC};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::id::RequestId;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of the notification that cancels an in-flight request.
pub const CANCELLED_METHOD: &str = "notifications/cancelled";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const REQUEST_TIMEOUT: i64 = -32001;
pub const REQUEST_CANCELLED: i64 = -32800;

const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_CRC: usize = 0x2;
const FP_OFF_DATALEN: usize = 0x6;
const FP_OFF_DATA: usize = 0xa;

const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

/// Largest payload a single frame may carry.
pub const FP_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum PayloadType {
    Json = 1,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unsupported frame version {0}")]
    Version(u8),
    #[error("unknown payload type {0}")]
    PayloadType(u8),
    #[error("payload of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    #[error("calculated CRC {calculated:#06x} does not match frame CRC {expected:#06x}")]
    Crc { expected: u32, calculated: u32 },
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid JSON-RPC message: {0}")]
    Invalid(&'static str),
}

impl From<FrameError> for io::Error {
    fn from(e: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new<S: Into<String>>(code: i64, message: S) -> Self {
        ErrorObject {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        ErrorObject::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params<S: Into<String>>(message: S) -> Self {
        ErrorObject::new(INVALID_PARAMS, message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        ErrorObject::new(INTERNAL_ERROR, message)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, ErrorObject>,
}

/// Params of a `notifications/cancelled` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Notification {
    pub fn cancelled(id: RequestId, reason: Option<String>) -> Notification {
        let params = CancelledParams {
            request_id: id,
            reason,
        };
        Notification {
            method: String::from(CANCELLED_METHOD),
            params: serde_json::to_value(params).ok(),
        }
    }

    /// Returns the cancellation params if this is a well-formed
    /// `notifications/cancelled` notification.
    pub fn as_cancelled(&self) -> Option<CancelledParams> {
        if self.method != CANCELLED_METHOD {
            return None;
        }
        self.params
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())
    }
}

/// A classified JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn request(id: RequestId, method: &str, params: Option<Value>) -> Message {
        Message::Request(Request {
            id,
            method: String::from(method),
            params,
        })
    }

    pub fn notification(method: &str, params: Option<Value>) -> Message {
        Message::Notification(Notification {
            method: String::from(method),
            params,
        })
    }

    pub fn result(id: RequestId, result: Value) -> Message {
        Message::Response(Response {
            id,
            outcome: Ok(result),
        })
    }

    pub fn error(id: RequestId, error: ErrorObject) -> Message {
        Message::Response(Response {
            id,
            outcome: Err(error),
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(r) => {
                let mut obj = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": r.id,
                    "method": r.method,
                });
                if let Some(params) = &r.params {
                    obj["params"] = params.clone();
                }
                obj
            }
            Message::Notification(n) => {
                let mut obj = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "method": n.method,
                });
                if let Some(params) = &n.params {
                    obj["params"] = params.clone();
                }
                obj
            }
            Message::Response(r) => match &r.outcome {
                Ok(result) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": r.id,
                    "result": result,
                }),
                Err(error) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": r.id,
                    "error": error,
                }),
            },
        }
    }

    /// Classify a decoded JSON value as a request, notification or
    /// response.
    pub fn from_value(value: Value) -> Result<Message, FrameError> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(FrameError::Invalid("message is not an object")),
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => (),
            _ => return Err(FrameError::Invalid("missing jsonrpc version")),
        }

        let id = take_id(&mut obj)?;
        let params = obj.remove("params");

        match (obj.remove("method"), id) {
            (Some(Value::String(method)), Some(id)) => {
                Ok(Message::Request(Request { id, method, params }))
            }
            (Some(Value::String(method)), None) => {
                Ok(Message::Notification(Notification { method, params }))
            }
            (Some(_), _) => Err(FrameError::Invalid("method is not a string")),
            (None, Some(id)) => {
                match (obj.remove("result"), obj.remove("error")) {
                    (Some(result), None) => Ok(Message::result(id, result)),
                    (None, Some(error)) => {
                        let error = serde_json::from_value(error)?;
                        Ok(Message::error(id, error))
                    }
                    _ => Err(FrameError::Invalid(
                        "response needs exactly one of result and error",
                    )),
                }
            }
            (None, None) => {
                Err(FrameError::Invalid("message has neither method nor id"))
            }
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Message, FrameError> {
        let value: Value = serde_json::from_slice(buf)?;
        Message::from_value(value)
    }
}

fn take_id(obj: &mut Map<String, Value>) -> Result<Option<RequestId>, FrameError> {
    match obj.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(id) => serde_json::from_value(id)
            .map(Some)
            .map_err(|_| FrameError::Invalid("id must be a number or string")),
    }
}

/// Frame codec for JSON-RPC messages on a byte stream.
#[derive(Debug, Default)]
pub struct JsonRpcCodec;

impl Decoder for JsonRpcCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, io::Error> {
        if buf.len() < FP_HEADER_SZ {
            return Ok(None);
        }

        if buf[0] != FP_VERSION_CURRENT {
            return Err(FrameError::Version(buf[0]).into());
        }
        let payload_type: Option<PayloadType> =
            FromPrimitive::from_u8(buf[FP_OFF_TYPE]);
        if payload_type.is_none() {
            return Err(FrameError::PayloadType(buf[FP_OFF_TYPE]).into());
        }

        let expected_crc =
            BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4])
                as usize;
        if data_len > FP_MAX_PAYLOAD {
            return Err(FrameError::TooLarge(data_len).into());
        }

        if buf.len() < FP_HEADER_SZ + data_len {
            buf.reserve(FP_HEADER_SZ + data_len - buf.len());
            return Ok(None);
        }

        buf.advance(FP_HEADER_SZ);
        let data = buf.split_to(data_len);

        let calculated_crc = u32::from(State::<ARC>::calculate(&data));
        if calculated_crc != expected_crc {
            return Err(FrameError::Crc {
                expected: expected_crc,
                calculated: calculated_crc,
            }
            .into());
        }

        Message::parse(&data).map(Some).map_err(io::Error::from)
    }
}

impl Encoder<Message> for JsonRpcCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), io::Error> {
        encode_msg(&item, buf)
    }
}

pub fn encode_msg(msg: &Message, buf: &mut BytesMut) -> Result<(), io::Error> {
    let data = serde_json::to_vec(&msg.to_value())?;
    if data.len() > FP_MAX_PAYLOAD {
        return Err(FrameError::TooLarge(data.len()).into());
    }
    // Json is the only payload type, so the conversion cannot fail.
    let type_u8 = ToPrimitive::to_u8(&PayloadType::Json).unwrap_or(1);

    buf.reserve(FP_HEADER_SZ + data.len());
    buf.put_u8(FP_VERSION_CURRENT);
    buf.put_u8(type_u8);
    buf.put_u32(u32::from(State::<ARC>::calculate(&data)));
    buf.put_u32(data.len() as u32);
    buf.put_slice(&data);
    Ok(())
}
