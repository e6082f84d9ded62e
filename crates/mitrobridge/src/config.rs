//! # Configuration
//!
//! Connection settings for the extension, built once at startup and passed to
//! whoever needs them.
//!
//! Priority: env > settings file > defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

use crate::client::ClientOptions;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_SERVER_PORT: u16 = 8443;
const DEFAULT_AGENT_PORT: u16 = 8444;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Parse(toml::de::Error),
    /// A value is present but unusable.
    Invalid(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Config I/O error: {}", e),
            Self::Parse(e) => write!(f, "Config parse error: {}", e),
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A host and port pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An endpoint table where either key may be left out.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialEndpoint {
    host: Option<String>,
    port: Option<u16>,
}

impl PartialEndpoint {
    fn merge_onto(self, default: Endpoint) -> Endpoint {
        Endpoint {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
        }
    }
}

fn server_endpoint<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Endpoint, D::Error> {
    let partial = PartialEndpoint::deserialize(d)?;
    Ok(partial.merge_onto(Endpoint::new(DEFAULT_HOST, DEFAULT_SERVER_PORT)))
}

fn agent_endpoint<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Endpoint, D::Error> {
    let partial = PartialEndpoint::deserialize(d)?;
    Ok(partial.merge_onto(Endpoint::new(DEFAULT_HOST, DEFAULT_AGENT_PORT)))
}

/// Which browser the extension was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Firefox,
    Chrome,
    Safari,
    /// Running as a plain web page, outside any extension.
    Webpage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug_mode: bool,
    #[serde(deserialize_with = "server_endpoint")]
    pub server: Endpoint,
    #[serde(deserialize_with = "agent_endpoint")]
    pub agent: Endpoint,
    /// Both keys are required; a half-set failover is a parse error.
    pub failover: Option<Endpoint>,
    pub browser: Option<Browser>,
    pub call_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_mode: false,
            server: Endpoint::new(DEFAULT_HOST, DEFAULT_SERVER_PORT),
            agent: Endpoint::new(DEFAULT_HOST, DEFAULT_AGENT_PORT),
            failover: None,
            browser: None,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Settings of a local debug build.
    pub fn debug() -> Self {
        Self { debug_mode: true, ..Self::default() }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Applies `MITRO_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("MITRO_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("MITRO_PORT") {
            self.server.port = parse_port("MITRO_PORT", &port)?;
        }
        if let Some(host) = lookup("MITRO_AGENT_HOST") {
            self.agent.host = host;
        }
        if let Some(port) = lookup("MITRO_AGENT_PORT") {
            self.agent.port = parse_port("MITRO_AGENT_PORT", &port)?;
        }
        if let Some(debug) = lookup("MITRO_DEBUG") {
            self.debug_mode = matches!(debug.as_str(), "true" | "1" | "yes");
        }

        match (lookup("FAILOVER_MITRO_HOST"), lookup("FAILOVER_MITRO_PORT")) {
            (Some(host), Some(port)) => {
                let port = parse_port("FAILOVER_MITRO_PORT", &port)?;
                self.failover = Some(Endpoint::new(host, port));
            }
            (None, None) => {}
            _ => {
                return Err(Error::Invalid(
                    "FAILOVER_MITRO_HOST and FAILOVER_MITRO_PORT must be set together".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut endpoints = vec![("server", &self.server), ("agent", &self.agent)];
        if let Some(failover) = &self.failover {
            endpoints.push(("failover", failover));
        }
        for (name, endpoint) in endpoints {
            if endpoint.host.is_empty() {
                return Err(Error::Invalid(format!("{} host is empty", name)));
            }
            if endpoint.port == 0 {
                return Err(Error::Invalid(format!("{} port is 0", name)));
            }
        }
        if self.call_timeout_ms == 0 {
            return Err(Error::Invalid("call_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Servers to try, primary first.
    pub fn server_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        std::iter::once(&self.server).chain(self.failover.as_ref())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::Invalid(format!("{} is not a port: '{}'", key, value)))
}
