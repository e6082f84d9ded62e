//! # Remote Call Client
//!
//! The page-context side of the bridge. A `Client` lets code in a page call
//! procedures that live in another context (the extension background) by name.
//!
//! Every client owns two tasks:
//! - a writer that drains an ordered outbox onto the transport, so calls
//!   return immediately and frames leave in call order;
//! - a pump that reads the transport and routes each reply to the pending
//!   invocation with the same sequence number, or an event to its handler.
//!
//! When the last clone of a client is dropped the pump is stopped and the
//! writer exits after draining, which releases the transport.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use mitrorpc::CallFrame;
use mitrorpc::FailureReason;
use mitrorpc::RpcFrame;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::registry;
use crate::registry::Registry;
use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum Error {
    /// `init_remote_calls` was given a conflicting or empty registration.
    Configuration(registry::Error),
    /// The procedure was never registered. Nothing was sent.
    Unregistered(String),
    Transport(transport::Error),
    Wire(mitrorpc::Error),
    /// The other context answered with a failure.
    Remote(FailureReason),
    /// No reply arrived within the call timeout.
    Timeout,
    /// The client can no longer deliver or receive frames.
    ChannelClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(e) => write!(f, "Configuration error: {}", e),
            Self::Unregistered(name) => write!(f, "Procedure '{}' is not registered", name),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Remote(reason) => write!(f, "Remote failure: {}", reason),
            Self::Timeout => write!(f, "Remote call timed out"),
            Self::ChannelClosed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<registry::Error> for Error {
    fn from(e: registry::Error) -> Self {
        Self::Configuration(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<mitrorpc::Error> for Error {
    fn from(e: mitrorpc::Error) -> Self {
        Self::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tunables for a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long a `PendingCall` waits for its reply.
    pub call_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { call_timeout: Duration::from_secs(30) }
    }
}

/// One outstanding call awaiting its reply.
struct PendingInvocation {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// A frame waiting in the outbox.
struct Outbound {
    seq: u64,
    payload: Vec<u8>,
}

/// Handler for one-way frames pushed to this client.
type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Owned by every clone of a `Client`; dropped with the last one.
struct Shutdown {
    pump: AbortHandle,
    pending: Arc<DashMap<u64, PendingInvocation>>,
    closed: Arc<AtomicBool>,
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pump.abort();
        Client::notify_all_pending(&self.pending, Error::ChannelClosed);
    }
}

/// Page-context proxy for procedures living in other contexts.
///
/// Cheap to clone; all clones share the registry, the pending table and the
/// sequence counter. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Client {
    client_id: Arc<str>,
    options: ClientOptions,
    registry: Arc<Registry>,
    pending: Arc<DashMap<u64, PendingInvocation>>,
    events: Arc<DashMap<String, EventHandler>>,
    seq_gen: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    outbox: mpsc::UnboundedSender<Outbound>,
    transport: Arc<dyn Transport>,
    _shutdown: Arc<Shutdown>,
}

impl Client {
    /// Creates a client named `client_id` (e.g. `"extension"`) with default options.
    pub fn new(client_id: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self::with_options(client_id, transport, ClientOptions::default())
    }

    /// Creates a client and spawns its writer and pump tasks.
    /// Takes ownership of the transport.
    pub fn with_options(
        client_id: impl Into<String>,
        transport: Box<dyn Transport>,
        options: ClientOptions,
    ) -> Self {
        let client_id: Arc<str> = Arc::from(client_id.into());
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending = Arc::new(DashMap::new());
        let events = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::write_loop(transport.clone(), outbox_rx, pending.clone()));
        let pump = tokio::spawn(Self::pump(
            client_id.clone(),
            transport.clone(),
            pending.clone(),
            events.clone(),
            closed.clone(),
        ));
        let shutdown = Arc::new(Shutdown {
            pump: pump.abort_handle(),
            pending: pending.clone(),
            closed: closed.clone(),
        });

        Self {
            client_id,
            options,
            registry: Arc::new(Registry::new()),
            pending,
            events,
            seq_gen: Arc::new(AtomicU64::new(1)),
            closed,
            outbox,
            transport,
            _shutdown: shutdown,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the inbound side of the channel has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the channel for every clone of this client.
    ///
    /// New calls fail with `ChannelClosed`. Calls still waiting fail once the
    /// pump sees the end of the stream, and the other side sees it too.
    pub fn close(&self) {
        debug!(client = %self.client_id, "closing");
        self.closed.store(true, Ordering::SeqCst);
        self.transport.close();
    }

    /// Makes each name in `names` callable, executed by the `target` context.
    pub fn init_remote_calls<I, S>(&self, target: &str, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry.register(target, names)?;
        Ok(())
    }

    /// Returns a proxy bound to one registered procedure.
    pub fn remote(&self, method: &str) -> Result<Remote> {
        self.target_of(method)?;
        Ok(Remote {
            client: self.clone(),
            method: method.to_owned(),
        })
    }

    /// Registers a handler for one-way frames named `event` sent to this client.
    pub fn on(&self, event: impl Into<String>, handler: impl Fn(Vec<Value>) + Send + Sync + 'static) {
        self.events.insert(event.into(), Arc::new(handler));
    }

    /// Calls `method` and returns a handle that resolves with its reply.
    ///
    /// Never blocks: the frame is queued and sent by the writer task.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<PendingCall> {
        let target = self.target_of(method)?;
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let payload = RpcFrame::from(CallFrame::new(seq, &*self.client_id, target, method, args)).encode()?;

        let deadline = Instant::now() + self.options.call_timeout;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, PendingInvocation { method: method.to_owned(), tx });

        // the pump sets `closed` before draining the table, so either it sees
        // this entry or we see the flag
        if self.is_closed() {
            self.pending.remove(&seq);
            return Err(Error::ChannelClosed);
        }
        if self.outbox.send(Outbound { seq, payload }).is_err() {
            self.pending.remove(&seq);
            return Err(Error::ChannelClosed);
        }

        debug!(client = %self.client_id, seq, method, "call queued");
        Ok(PendingCall {
            seq,
            method: method.to_owned(),
            rx: Some(rx),
            pending: self.pending.clone(),
            deadline,
        })
    }

    /// Calls `method` and hands the outcome to one of two callbacks.
    ///
    /// Returns the sequence number of the call.
    pub fn call_with<S, E>(&self, method: &str, args: Vec<Value>, on_success: S, on_error: E) -> Result<u64>
    where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        let pending = self.call(method, args)?;
        let seq = pending.seq();
        tokio::spawn(async move {
            match pending.wait().await {
                Ok(value) => on_success(value),
                Err(e) => on_error(e),
            }
        });
        Ok(seq)
    }

    /// Sends a one-way call. The other side never answers it.
    ///
    /// Returns the sequence number of the frame.
    pub fn emit(&self, method: &str, args: Vec<Value>) -> Result<u64> {
        let target = self.target_of(method)?;
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let frame = CallFrame::new(seq, &*self.client_id, target, method, args).one_way();
        let payload = RpcFrame::from(frame).encode()?;

        self.outbox
            .send(Outbound { seq, payload })
            .map_err(|_| Error::ChannelClosed)?;

        debug!(client = %self.client_id, seq, method, "event queued");
        Ok(seq)
    }

    fn target_of(&self, method: &str) -> Result<String> {
        self.registry
            .target_of(method)
            .ok_or_else(|| Error::Unregistered(method.to_owned()))
    }

    /// Sends queued frames in order until every client handle is dropped.
    async fn write_loop(
        transport: Arc<dyn Transport>,
        mut outbox: mpsc::UnboundedReceiver<Outbound>,
        pending: Arc<DashMap<u64, PendingInvocation>>,
    ) {
        while let Some(out) = outbox.recv().await {
            if let Err(e) = transport.send(&out.payload).await {
                warn!(seq = out.seq, error = %e, "failed to send frame");
                if let Some((_, invocation)) = pending.remove(&out.seq) {
                    let _ = invocation.tx.send(Err(Error::Transport(e)));
                }
            }
        }
        debug!("outbox closed");
    }

    /// Reads the transport until it closes, then fails whatever is still pending.
    async fn pump(
        client_id: Arc<str>,
        transport: Arc<dyn Transport>,
        pending: Arc<DashMap<u64, PendingInvocation>>,
        events: Arc<DashMap<String, EventHandler>>,
        closed: Arc<AtomicBool>,
    ) {
        let error = loop {
            match transport.recv().await {
                Ok(Some(msg)) => Self::handle_message(&client_id, &msg, &pending, &events),
                Ok(None) => break transport::Error::ConnectionLost("Stream closed".into()),
                Err(e) => {
                    warn!(client = %client_id, error = %e, "transport error in pump");
                    break e;
                }
            }
        };

        closed.store(true, Ordering::SeqCst);
        debug!(client = %client_id, pending = pending.len(), "pump stopped");
        Self::notify_all_pending(&pending, Error::Transport(error));
    }

    fn notify_all_pending(pending: &DashMap<u64, PendingInvocation>, error: Error) {
        let keys: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, invocation)) = pending.remove(&key) {
                let _ = invocation.tx.send(Err(error.clone()));
            }
        }
    }

    /// Routes one inbound frame. Bad frames are logged and dropped.
    fn handle_message(
        client_id: &str,
        msg: &[u8],
        pending: &DashMap<u64, PendingInvocation>,
        events: &DashMap<String, EventHandler>,
    ) {
        let frame = match RpcFrame::decode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(client = %client_id, error = %e, "dropping undecodable frame");
                return;
            }
        };

        match frame {
            RpcFrame::Reply(reply) => {
                if reply.client != client_id {
                    warn!(client = %client_id, to = %reply.client, seq = reply.seq, "dropping reply for another client");
                    return;
                }
                // late (after timeout) or duplicate replies have no entry
                let Some((_, invocation)) = pending.remove(&reply.seq) else {
                    debug!(client = %client_id, seq = reply.seq, "no pending call for reply");
                    return;
                };
                debug!(client = %client_id, seq = reply.seq, method = %invocation.method, "reply received");
                let _ = invocation.tx.send(reply.status.map_err(Error::Remote));
            }
            RpcFrame::Call(call) => {
                if call.target != client_id {
                    warn!(client = %client_id, target = %call.target, "dropping call for another context");
                    return;
                }
                if call.reply {
                    warn!(client = %client_id, method = %call.method, "page contexts do not answer calls");
                }
                let handler = events.get(&call.method).map(|h| h.value().clone());
                let Some(handler) = handler else {
                    debug!(client = %client_id, event = %call.method, "no handler for event");
                    return;
                };
                // a panicking handler must not take the pump down with it
                if std::panic::catch_unwind(AssertUnwindSafe(|| handler(call.args))).is_err() {
                    warn!(client = %client_id, event = %call.method, "event handler panicked");
                }
            }
        }
    }
}

/// A registered procedure bound to its client.
#[derive(Clone)]
pub struct Remote {
    client: Client,
    method: String,
}

impl Remote {
    pub fn name(&self) -> &str {
        &self.method
    }

    pub fn call(&self, args: Vec<Value>) -> Result<PendingCall> {
        self.client.call(&self.method, args)
    }

    pub fn emit(&self, args: Vec<Value>) -> Result<u64> {
        self.client.emit(&self.method, args)
    }
}

/// Completion handle for one call.
///
/// The call timeout runs from the moment the call was issued, not from
/// `wait()`. The pending entry lives until the handle is awaited or dropped.
/// Dropping the handle abandons the call: its entry is removed and a later
/// reply is ignored.
pub struct PendingCall {
    seq: u64,
    method: String,
    rx: Option<oneshot::Receiver<Result<Value>>>,
    pending: Arc<DashMap<u64, PendingInvocation>>,
    deadline: Instant,
}

impl PendingCall {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Waits for the reply, until the call's deadline.
    pub async fn wait(mut self) -> Result<Value> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::ChannelClosed);
        };
        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                debug!(seq = self.seq, method = %self.method, "call timed out");
                Err(Error::Timeout)
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.pending.remove(&self.seq);
    }
}
