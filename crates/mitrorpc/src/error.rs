//! # Error Definitions
//!
//! Local wire failures and the remote failure reasons carried inside replies.

use serde::Deserialize;
use serde::Serialize;

/// Failures while framing or unframing a message.
#[derive(Debug, Clone)]
pub enum Error {
    /// The JSON body could not be produced or parsed.
    Json(String),
    /// The frame exceeds `MAX_FRAME_LEN`.
    FrameTooLarge { len: usize, max: usize },
    /// The frame parsed but its structure is wrong (e.g. missing seq).
    ProtocolViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "JSON error: {}", msg),
            Self::FrameTooLarge { len, max } => write!(f, "Frame of {} bytes exceeds limit of {}", len, max),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Self::Json(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons for a remote failure (the "Err" side of a Reply).
///
/// These are distinct from `Error`: they describe the *background* failing
/// to run a procedure, whereas `Error` describes the *wire* failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail")]
pub enum FailureReason {
    /// No procedure with this name is registered in the target context.
    NoProcedure(String),
    /// The arguments did not fit the procedure.
    BadArguments(String),
    /// The procedure ran and reported an error.
    Failed(String),
    /// The call frame was malformed or misaddressed.
    ProtocolViolation(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoProcedure(name) => write!(f, "no procedure named '{}'", name),
            Self::BadArguments(msg) => write!(f, "bad arguments: {}", msg),
            Self::Failed(msg) => write!(f, "{}", msg),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}
