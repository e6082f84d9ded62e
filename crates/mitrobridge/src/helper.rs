//! Extension helper and the set-location test reporter.

use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use serde_json::json;
use tracing::info;

use crate::client;
use crate::client::Client;

pub const SET_LOCATION: &str = "setLocation";
pub const REPORT_SET_LOCATION_SUCCESS: &str = "reportSetLocationSuccess";
pub const REPORT_EXTENSION_FINISHED: &str = "reportExtensionFinished";

/// Page-side helper for things only the extension may do, such as moving the
/// current tab to another extension page.
#[derive(Default)]
pub struct ExtensionHelper {
    client: OnceLock<Client>,
    location: Mutex<Option<String>>,
}

impl ExtensionHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the helper to a client. The first bound client wins.
    pub fn bind_client(&self, client: Client) -> client::Result<()> {
        client.init_remote_calls("background", [SET_LOCATION])?;
        let _ = self.client.set(client);
        Ok(())
    }

    /// Navigates to `url`, asking the background to move the tab when bound.
    pub fn set_location(&self, url: &str) -> client::Result<()> {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.to_owned());
        info!(url, "set location");
        if let Some(client) = self.client.get() {
            client.emit(SET_LOCATION, vec![json!(url)])?;
        }
        Ok(())
    }

    /// The last location set through this helper.
    pub fn location(&self) -> Option<String> {
        self.location.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Reports that the set-location test page was reached, and that it was the
/// last of the extension tests.
pub fn report_set_location(client: &Client) -> client::Result<()> {
    client.init_remote_calls("background", [REPORT_SET_LOCATION_SUCCESS, REPORT_EXTENSION_FINISHED])?;
    client.emit(REPORT_SET_LOCATION_SUCCESS, vec![])?;
    client.emit(REPORT_EXTENSION_FINISHED, vec![])?;
    Ok(())
}
