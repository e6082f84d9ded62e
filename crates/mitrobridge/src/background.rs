//! # Background Dispatcher
//!
//! The serving side of the bridge: a table of named procedures and a loop that
//! answers calls arriving on a transport. Each call runs on its own task, so
//! replies may leave in a different order than the calls arrived.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use mitrorpc::CallFrame;
use mitrorpc::FailureReason;
use mitrorpc::ReplyFrame;
use mitrorpc::RpcFrame;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum Error {
    Transport(transport::Error),
    Wire(mitrorpc::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

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

pub type ProcedureResult = std::result::Result<Value, FailureReason>;

type Handler = Arc<
    dyn Fn(CallContext, Vec<Value>) -> Pin<Box<dyn Future<Output = ProcedureResult> + Send>>
        + Send
        + Sync,
>;

/// What a procedure knows about the call it is serving.
#[derive(Clone)]
pub struct CallContext {
    client: String,
    seq: u64,
    context: Arc<str>,
    transport: Arc<dyn Transport>,
    event_seq: Arc<AtomicU64>,
}

impl CallContext {
    /// The id of the client that made the call.
    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Pushes a one-way frame named `event` back to the calling client.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let frame = CallFrame::new(seq, &*self.context, &self.client, event, args).one_way();
        let payload = RpcFrame::from(frame).encode()?;
        self.transport.send(&payload).await?;
        Ok(())
    }
}

/// A named execution context serving procedures, e.g. `"background"`.
pub struct Background {
    name: Arc<str>,
    handlers: DashMap<String, Handler>,
    event_seq: Arc<AtomicU64>,
}

impl Background {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            handlers: DashMap::new(),
            event_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `handler` under `method`, replacing any earlier one.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcedureResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |ctx: CallContext, args: Vec<Value>| -> Pin<Box<dyn Future<Output = ProcedureResult> + Send>> {
                Box::pin(handler(ctx, args))
            },
        );
        self.handlers.insert(method.into(), handler);
    }

    /// Answers calls on `transport` until the other side goes away.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<()> {
        while let Some(msg) = transport.recv().await? {
            self.handle_message(&transport, &msg).await;
        }
        debug!(context = %self.name, "transport closed, serve loop done");
        Ok(())
    }

    async fn handle_message(&self, transport: &Arc<dyn Transport>, msg: &[u8]) {
        let call = match RpcFrame::decode(msg) {
            Ok(RpcFrame::Call(call)) => call,
            Ok(RpcFrame::Reply(reply)) => {
                warn!(context = %self.name, seq = reply.seq, "background does not expect replies");
                return;
            }
            Err(e) => {
                match mitrorpc::decode_seq(msg) {
                    Ok((seq, Some(client))) => {
                        let reason = FailureReason::ProtocolViolation(e.to_string());
                        send_reply(transport, ReplyFrame::err(seq, client, reason)).await;
                    }
                    _ => warn!(context = %self.name, error = %e, "dropping undecodable frame"),
                }
                return;
            }
        };

        debug!(context = %self.name, client = %call.client, seq = call.seq, method = %call.method, "call received");

        if call.target != self.name.as_ref() {
            let reason = FailureReason::ProtocolViolation(format!("call addressed to '{}'", call.target));
            if call.reply {
                send_reply(transport, ReplyFrame::err(call.seq, call.client, reason)).await;
            }
            return;
        }

        let handler = self.handlers.get(&call.method).map(|h| h.value().clone());
        let Some(handler) = handler else {
            warn!(context = %self.name, method = %call.method, "no such procedure");
            if call.reply {
                let reason = FailureReason::NoProcedure(call.method.clone());
                send_reply(transport, ReplyFrame::err(call.seq, call.client, reason)).await;
            }
            return;
        };

        let ctx = CallContext {
            client: call.client.clone(),
            seq: call.seq,
            context: self.name.clone(),
            transport: transport.clone(),
            event_seq: self.event_seq.clone(),
        };
        let transport = transport.clone();
        tokio::spawn(async move {
            let status = handler(ctx, call.args).await;
            if let Err(reason) = &status {
                debug!(seq = call.seq, method = %call.method, %reason, "procedure failed");
            }
            if call.reply {
                send_reply(&transport, ReplyFrame { seq: call.seq, client: call.client, status }).await;
            }
        });
    }
}

async fn send_reply(transport: &Arc<dyn Transport>, reply: ReplyFrame) {
    let seq = reply.seq;
    let payload = match RpcFrame::from(reply).encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(seq, error = %e, "failed to encode reply");
            return;
        }
    };
    if let Err(e) = transport.send(&payload).await {
        warn!(seq, error = %e, "failed to send reply");
    }
}
