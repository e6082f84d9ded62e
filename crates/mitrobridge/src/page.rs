//! # Create-secret page
//!
//! A headless model of the admin "create secret" page: which elements are
//! shown, what text they hold, and what each button does. Every action that
//! needs credentials goes to the background through the bridge.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::client;
use crate::client::Client;
use crate::helper::ExtensionHelper;

pub const ORG_ID: &str = "#secret-org-id";
pub const CONTENT: &str = ".content";
pub const UGLY_MESSAGE: &str = ".ugly-message";
pub const FOR_MANUAL: &str = ".for-manual";
pub const FOR_NOTE: &str = ".for-note";

pub const ADD_SECRET: &str = "addSecret";
pub const EDIT_SITE_SHARES: &str = "editSiteShares";
pub const LOAD_ORGANIZATION_INFO: &str = "loadOrganizationInfo";

const MANAGE_SECRET_PAGE: &str = "admin-manage-secret.html";

/// Visibility and text of the elements the page touches, keyed by selector.
///
/// Elements are visible unless hidden.
#[derive(Debug, Default, Clone)]
pub struct PageView {
    hidden: HashMap<String, bool>,
    text: HashMap<String, String>,
}

impl PageView {
    pub fn show(&mut self, selector: &str) {
        self.hidden.insert(selector.to_owned(), false);
    }

    pub fn hide(&mut self, selector: &str) {
        self.hidden.insert(selector.to_owned(), true);
    }

    pub fn is_visible(&self, selector: &str) -> bool {
        !self.hidden.get(selector).copied().unwrap_or(false)
    }

    pub fn set_text(&mut self, selector: &str, text: impl Into<String>) {
        self.text.insert(selector.to_owned(), text.into());
    }

    pub fn text(&self, selector: &str) -> Option<&str> {
        self.text.get(selector).map(String::as_str)
    }
}

/// What the user typed into the form.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SecretForm {
    pub title: String,
    pub login_url: String,
    pub username: String,
    pub password: String,
    pub note: String,
}

/// The form split into what the server may see and what gets encrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct SecretData {
    pub client_data: Value,
    pub secret_data: Value,
    pub org_id: Option<i64>,
}

struct PageState {
    view: PageView,
    form: SecretForm,
    is_secure_note: bool,
}

/// Controller for the create-secret page.
pub struct CreatePage {
    client: Client,
    helper: Arc<ExtensionHelper>,
    state: Mutex<PageState>,
}

impl CreatePage {
    /// Registers the background procedures this page uses on `client`.
    pub fn new(client: Client, helper: Arc<ExtensionHelper>) -> client::Result<Self> {
        client.init_remote_calls("background", [ADD_SECRET, EDIT_SITE_SHARES, LOAD_ORGANIZATION_INFO])?;

        let mut view = PageView::default();
        view.hide(FOR_NOTE);
        view.hide(UGLY_MESSAGE);

        Ok(Self {
            client,
            helper,
            state: Mutex::new(PageState {
                view,
                form: SecretForm::default(),
                is_secure_note: false,
            }),
        })
    }

    pub async fn view(&self) -> PageView {
        self.state.lock().await.view.clone()
    }

    pub async fn fill(&self, form: SecretForm) {
        self.state.lock().await.form = form;
    }

    /// Shows the selected organization, if the user has one.
    pub async fn load(&self) {
        let result = match self.client.call(LOAD_ORGANIZATION_INFO, vec![]) {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(info) => {
                let org_id = info.get("selectedOrganization").and_then(|org| org.get("id"));
                if let Some(id) = org_id {
                    let id = match id {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    self.state.lock().await.view.set_text(ORG_ID, id);
                }
            }
            Err(e) => self.on_background_error(&e).await,
        }
    }

    /// `#is-secure-note` was clicked.
    pub async fn click_secure_note(&self) {
        let mut state = self.state.lock().await;
        state.is_secure_note = true;
        state.view.hide(FOR_MANUAL);
        state.view.show(FOR_NOTE);
    }

    /// `#is-web-password` was clicked.
    pub async fn click_web_password(&self) {
        let mut state = self.state.lock().await;
        state.is_secure_note = false;
        state.view.show(FOR_MANUAL);
        state.view.hide(FOR_NOTE);
    }

    /// `#save-secret-button` was clicked. Returns the page navigated to.
    pub async fn click_save(&self) -> client::Result<String> {
        let data = {
            let mut state = self.state.lock().await;
            state.view.hide(CONTENT);
            state.view.set_text(UGLY_MESSAGE, "Saving data ...");
            state.view.show(UGLY_MESSAGE);
            secret_data_from_page(&state)
        };

        match self.save(data).await {
            Ok(location) => Ok(location),
            Err(e) => {
                self.on_background_error(&e).await;
                Err(e)
            }
        }
    }

    async fn save(&self, data: SecretData) -> client::Result<String> {
        let secret_id = self
            .client
            .call(ADD_SECRET, vec![json!({}), data.client_data, data.secret_data])?
            .wait()
            .await?;
        debug!(%secret_id, "secret added");

        if let Some(org_id) = data.org_id {
            // the id goes back exactly as the background returned it
            self.client
                .call(EDIT_SITE_SHARES, vec![secret_id.clone(), json!([]), json!([]), json!(org_id)])?
                .wait()
                .await?;
        }

        let secret_id = match secret_id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let location = format!("{}?secretId={}", MANAGE_SECRET_PAGE, secret_id);
        self.helper.set_location(&location)?;
        Ok(location)
    }

    async fn on_background_error(&self, error: &client::Error) {
        warn!(%error, "background call failed");
        let mut state = self.state.lock().await;
        state.view.set_text(UGLY_MESSAGE, format!("Error: {}", error));
        state.view.show(UGLY_MESSAGE);
        state.view.show(CONTENT);
    }
}

fn secret_data_from_page(state: &PageState) -> SecretData {
    let form = &state.form;
    let org_id = state
        .view
        .text(ORG_ID)
        .and_then(|text| text.trim().parse().ok());

    if state.is_secure_note {
        SecretData {
            client_data: json!({ "type": "note", "title": form.title }),
            secret_data: json!({ "note": form.note }),
            org_id,
        }
    } else {
        SecretData {
            client_data: json!({
                "type": "manual",
                "title": form.title,
                "loginUrl": form.login_url,
                "username": form.username,
            }),
            secret_data: json!({ "password": form.password }),
            org_id,
        }
    }
}
