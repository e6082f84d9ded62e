//! Runs the set-location extension test against an in-process background and
//! prints what the background was told.
//!
//! Usage: `mitro-harness [config.toml]`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use mitrobridge::Background;
use mitrobridge::Client;
use mitrobridge::Config;
use mitrobridge::DuplexChannelTransport;
use mitrobridge::Transport;
use mitrobridge::helper;
use mitrobridge::helper::ExtensionHelper;
use mitrobridge::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("loading {}", path))?,
        None => Config::debug(),
    };
    config.apply_env()?;
    config.validate()?;
    logging::init(&config);

    let servers: Vec<String> = config.server_endpoints().map(|e| e.to_string()).collect();
    info!(?servers, agent = %config.agent, debug = config.debug_mode, "starting harness");

    let (page_side, background_side) = DuplexChannelTransport::pair();

    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
    let background = Arc::new(Background::new("background"));
    for name in [helper::REPORT_SET_LOCATION_SUCCESS, helper::REPORT_EXTENSION_FINISHED] {
        let reports_tx = reports_tx.clone();
        background.register(name, move |ctx, _args| {
            let report = format!("{} from {}", name, ctx.client());
            let reports_tx = reports_tx.clone();
            async move {
                let _ = reports_tx.send(report);
                Ok(Value::Null)
            }
        });
    }
    drop(reports_tx);

    let background_transport: Arc<dyn Transport> = Arc::new(background_side);
    let serving = background.clone();
    tokio::spawn(async move { serving.serve(background_transport).await });

    let client = Client::with_options("extension", Box::new(page_side), config.client_options());
    let extension = ExtensionHelper::new();
    extension.bind_client(client.clone())?;
    helper::report_set_location(&client)?;

    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_millis(config.call_timeout_ms), reports_rx.recv()).await {
            Ok(Some(report)) => info!(%report, "background received report"),
            Ok(None) => bail!("background stopped before all reports arrived"),
            Err(_) => bail!("timed out waiting for reports"),
        }
    }

    info!("extension tests finished");
    Ok(())
}
