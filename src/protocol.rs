//! Message types of the request envelope.
//!
//! The envelope is how out-of-process drivers talk to the core: each request
//! carries a driver-chosen `callback_idx` which the matching response echoes
//! back, so a driver can multiplex any number of requests over one stream.
//! Framing is a u32 length prefix followed by a postcard payload
//! (see [`crate::codec::envelope`]).

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::frame::ValkeyFrame;
use crate::routing::RoutingSpec;

pub type CallbackId = u64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub callback_idx: CallbackId,
    pub kind: RequestKind,
    /// Overrides the routing the core would derive from the command itself.
    pub route: Option<RoutingSpec>,
    /// Overrides the configured request timeout.
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RequestKind {
    Single(CommandSpec),
    Transaction(Vec<CommandSpec>),
    ScriptInvocation {
        hash: String,
        keys: Vec<Vec<u8>>,
        args: Vec<Vec<u8>>,
    },
}

/// A command as the driver sent it: name and arguments, uninterpreted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub parts: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub callback_idx: CallbackId,
    pub result: ResponseResult,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ResponseResult {
    /// Fast path for commands that reply `+OK`.
    Ok,
    Value(Value),
    RequestError {
        kind: RequestErrorKind,
        message: String,
    },
    /// The connection this client is built on is no longer usable.
    ClosingError(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    Disconnect,
    ExecAbort,
    Timeout,
    Unspecified,
}

/// A server reply in a form that serializes.
///
/// Conversion from [`ValkeyFrame`] happens on the per-request task, never on
/// a connection's reader task, so decoding a large bulk reply cannot stall
/// other responses sharing the socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Simple(String),
    Bulk(Vec<u8>),
    Int(i64),
    Array(Vec<Value>),
}

impl Value {
    pub fn from_frame(frame: ValkeyFrame) -> Value {
        match frame {
            ValkeyFrame::Null => Value::Null,
            ValkeyFrame::SimpleString(s) => {
                Value::Simple(String::from_utf8_lossy(s.as_ref()).into_owned())
            }
            ValkeyFrame::BulkString(b) => Value::Bulk(b.to_vec()),
            ValkeyFrame::Integer(i) => Value::Int(i),
            ValkeyFrame::Array(frames) => {
                Value::Array(frames.into_iter().map(Value::from_frame).collect())
            }
            // The dispatcher surfaces error frames as Err before this point.
            ValkeyFrame::Error(e) => Value::Simple(e.to_string()),
        }
    }
}

impl ResponseEnvelope {
    pub fn from_result(
        callback_idx: CallbackId,
        result: Result<ValkeyFrame, Error>,
    ) -> ResponseEnvelope {
        let result = match result {
            Ok(ValkeyFrame::SimpleString(ref s)) if s.as_ref() == b"OK" => ResponseResult::Ok,
            Ok(frame) => ResponseResult::Value(Value::from_frame(frame)),
            Err(Error::Closing) => ResponseResult::ClosingError(Error::Closing.to_string()),
            Err(err) => ResponseResult::RequestError {
                kind: RequestErrorKind::from(&err),
                message: err.to_string(),
            },
        };
        ResponseEnvelope {
            callback_idx,
            result,
        }
    }
}

impl From<&Error> for RequestErrorKind {
    fn from(error: &Error) -> Self {
        match error {
            Error::Connection(_) => RequestErrorKind::Disconnect,
            Error::Timeout => RequestErrorKind::Timeout,
            Error::ExecAbort(_) => RequestErrorKind::ExecAbort,
            _ => RequestErrorKind::Unspecified,
        }
    }
}
