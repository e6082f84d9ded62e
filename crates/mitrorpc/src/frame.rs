//! # Protocol Frames
//!
//! Defines the envelope exchanged between a page context and the background
//! context (Call vs Reply).
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown fields are ignored by the decoder.
//! - **Bounded**: Frames larger than `MAX_FRAME_LEN` are refused in both directions.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::FailureReason;
use crate::error::Result;

/// Upper bound on a single encoded frame.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// An invocation of `method` in the `target` context on behalf of `client`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub seq: u64,
    pub client: String,
    pub target: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Whether the sender is waiting for a Reply. One-way calls carry `false`.
    #[serde(default)]
    pub reply: bool,
}

impl CallFrame {
    pub fn new(
        seq: u64,
        client: impl Into<String>,
        target: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            seq,
            client: client.into(),
            target: target.into(),
            method: method.into(),
            args,
            reply: true,
        }
    }

    /// Marks the call as one-way: the receiver must not answer it.
    pub fn one_way(mut self) -> Self {
        self.reply = false;
        self
    }
}

/// The answer to a `CallFrame` with `reply = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub seq: u64,
    /// The client the call originated from.
    pub client: String,
    pub status: std::result::Result<Value, FailureReason>,
}

impl ReplyFrame {
    pub fn ok(seq: u64, client: impl Into<String>, value: Value) -> Self {
        Self { seq, client: client.into(), status: Ok(value) }
    }

    pub fn err(seq: u64, client: impl Into<String>, reason: FailureReason) -> Self {
        Self { seq, client: client.into(), status: Err(reason) }
    }
}

/// Top-level frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RpcFrame {
    Call(CallFrame),
    Reply(ReplyFrame),
}

impl RpcFrame {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Call(call) => call.seq,
            Self::Reply(reply) => reply.seq,
        }
    }

    /// Encodes the frame into a single transport message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        check_len(bytes.len())?;
        Ok(bytes)
    }

    /// Decodes a frame from a single transport message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes.len())?;
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl From<CallFrame> for RpcFrame {
    fn from(call: CallFrame) -> Self { Self::Call(call) }
}

impl From<ReplyFrame> for RpcFrame {
    fn from(reply: ReplyFrame) -> Self { Self::Reply(reply) }
}

/// Decodes just the sequence number and client from a raw frame.
/// This is useful for answering a call when the full decoding fails.
pub fn decode_seq(bytes: &[u8]) -> Result<(u64, Option<String>)> {
    check_len(bytes.len())?;
    let raw: Value = serde_json::from_slice(bytes)?;
    let seq = raw
        .get("seq")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::ProtocolViolation("Missing seq".into()))?;
    let client = raw.get("client").and_then(Value::as_str).map(str::to_owned);
    Ok((seq, client))
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge { len, max: MAX_FRAME_LEN });
    }
    Ok(())
}
