//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between a page context and the
//! background context.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about frames or procedures.
//!   It moves opaque buffers, one frame per message.
//! - **Duplex**: Either side may send at any time. Request/response matching
//!   is done above this layer by sequence number.
//! - **Closable from one end**: closing ends our `recv()` and is seen by the
//!   other end as end-of-stream.

use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::mpsc;
use tokio::sync::watch;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The other context is unreachable or the channel was torn down.
    ConnectionLost(String),
    /// This end was closed with `close()`.
    Closed,
    /// The message is bigger than the channel carries.
    PayloadTooLarge { len: usize, max: usize },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Transport closed"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "Payload of {} bytes exceeds the {} byte limit", len, max)
            }
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A message channel to another execution context.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues one message for the other side.
    ///
    /// # invariants
    /// - Messages sent on one transport arrive in send order.
    /// - Should not interpret the payload content.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next message. `Ok(None)` means the channel is over,
    /// either because the other side is gone or this side was closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Tears down this end. Later sends fail and a pending `recv()` returns
    /// `Ok(None)`. The default does nothing.
    fn close(&self) {}
}

/// An in-process duplex channel, the stand-in for the browser's port between
/// a page and the background page.
///
/// Messages sent on one end appear on the peer's `recv()` and vice versa.
pub struct DuplexChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closing: watch::Sender<bool>,
    max_message: usize,
}

impl DuplexChannelTransport {
    /// Creates a pair of transports connected to each other.
    ///
    /// Dropping or closing one end makes `recv()` on the other return
    /// `Ok(None)` once the messages already sent are read.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::end(tx_a, rx_b), Self::end(tx_b, rx_a))
    }

    fn end(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closing: watch::Sender::new(false),
            max_message: mitrorpc::MAX_FRAME_LEN,
        }
    }

    /// Caps the size of a single outgoing message.
    pub fn with_max_message(mut self, max: usize) -> Self {
        self.max_message = max;
        self
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_message {
            return Err(Error::PayloadTooLarge { len: payload.len(), max: self.max_message });
        }
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(tx) = tx else {
            return Err(Error::Closed);
        };
        tx.send(payload.to_vec())
            .map_err(|_| Error::ConnectionLost("Peer dropped".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut closing = self.closing.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = async { closing.wait_for(|closed| *closed).await.is_ok() } => Ok(None),
            msg = rx.recv() => Ok(msg),
        }
    }

    fn close(&self) {
        // dropping our sender is what the peer sees as end-of-stream
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.closing.send_replace(true);
    }
}
