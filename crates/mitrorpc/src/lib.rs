//! # MitroRPC
//!
//! The wire protocol spoken between a page context and the extension's
//! background context.
//!
//! ## Architecture
//!
//! Every transport message carries exactly one JSON frame. A `Call` names the
//! calling client, the target context, the procedure and its positional
//! arguments. A `Reply` echoes the call's sequence number and carries either
//! the procedure's result or a `FailureReason`. Calls marked one-way are never
//! answered; they are how reports and events travel.

pub mod error;
pub mod frame;

pub use error::Error;
pub use error::FailureReason;
pub use error::Result;
pub use frame::CallFrame;
pub use frame::MAX_FRAME_LEN;
pub use frame::ReplyFrame;
pub use frame::RpcFrame;
pub use frame::decode_seq;
