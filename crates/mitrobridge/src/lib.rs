//! # MitroBridge
//!
//! Lets code running in an extension page call procedures that live in the
//! extension's background context, and lets the background push reports back.
//!
//! - `client`: the page side; registration, pending calls, inbound pump.
//! - `background`: the serving side; a procedure table behind a transport.
//! - `transport`: the byte channel between the two.
//! - `config`, `page`, `helper`: the collaborators around the bridge.

pub mod background;
pub mod client;
pub mod config;
pub mod helper;
pub mod logging;
pub mod page;
pub mod registry;
pub mod transport;

pub use background::Background;
pub use background::CallContext;
pub use client::Client;
pub use client::ClientOptions;
pub use client::PendingCall;
pub use client::Remote;
pub use config::Config;
pub use transport::DuplexChannelTransport;
pub use transport::Transport;

#[cfg(test)]
mod tests;
