//! HTTP bootstrap against the browser's debugging endpoint.
//!
//! `/json/version` and `/json` are queried once at connect time; ongoing
//! target tracking rides CDP events. The helpers for opening and closing
//! tabs are used by the control surface and by tests.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;
use tokio::time::sleep;

use crate::error::CdpError;

/// CDP target type for browser pages.
pub const TARGET_TYPE_PAGE: &str = "page";

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Payload of `/json/version`.
#[derive(Clone, Debug, Deserialize)]
pub struct BrowserInfo {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,
    #[serde(rename = "User-Agent", default)]
    pub user_agent: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

/// One entry of the `/json` target list.
#[derive(Clone, Debug, Deserialize)]
pub struct TargetSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

fn client() -> Result<Client, CdpError> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| CdpError::Io(err.to_string()))
}

/// Browser metadata and the browser-level websocket URL.
pub async fn browser_info(port: u16) -> Result<BrowserInfo, CdpError> {
    let endpoint = format!("http://localhost:{port}/json/version");
    let response = client()?.get(&endpoint).send().await?;

    if !response.status().is_success() {
        return Err(CdpError::HttpStatus {
            endpoint,
            status: response.status().as_u16(),
        });
    }

    Ok(response.json().await?)
}

/// One-shot enumeration of open page targets.
pub async fn page_targets(port: u16) -> Result<Vec<TargetSummary>, CdpError> {
    let endpoint = format!("http://localhost:{port}/json");
    let response = client()?.get(&endpoint).send().await?;

    if !response.status().is_success() {
        return Err(CdpError::HttpStatus {
            endpoint,
            status: response.status().as_u16(),
        });
    }

    let targets: Vec<TargetSummary> = response.json().await?;
    Ok(targets
        .into_iter()
        .filter(|t| t.kind == TARGET_TYPE_PAGE)
        .collect())
}

/// Polls until `/json/version` answers and at least one page target exists.
pub async fn wait_for_browser(port: u16, timeout: Duration) -> Result<(), CdpError> {
    let deadline = Instant::now() + timeout;
    let mut version_ready = false;

    while Instant::now() < deadline {
        if !version_ready {
            version_ready = browser_info(port).await.is_ok();
        }

        if version_ready {
            if let Ok(targets) = page_targets(port).await {
                if !targets.is_empty() {
                    return Ok(());
                }
            }
        }

        sleep(POLL_INTERVAL).await;
    }

    if version_ready {
        Err(CdpError::Unreachable(format!(
            "browser on port {port} has no page targets after {timeout:?}"
        )))
    } else {
        Err(CdpError::Unreachable(format!(
            "browser not available on port {port} after {timeout:?}"
        )))
    }
}

/// Opens a new tab at `url` via the HTTP debugging API.
pub async fn open_tab(port: u16, url: &str) -> Result<(), CdpError> {
    let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
    let endpoint = format!("http://localhost:{port}/json/new?{encoded}");
    let response = client()?.put(&endpoint).send().await?;

    if !response.status().is_success() {
        return Err(CdpError::HttpStatus {
            endpoint,
            status: response.status().as_u16(),
        });
    }
    Ok(())
}

/// Closes a tab by target id via the HTTP debugging API.
pub async fn close_tab(port: u16, target_id: &str) -> Result<(), CdpError> {
    let endpoint = format!("http://localhost:{port}/json/close/{target_id}");
    let response = client()?.put(&endpoint).send().await?;

    if !response.status().is_success() {
        return Err(CdpError::HttpStatus {
            endpoint,
            status: response.status().as_u16(),
        });
    }
    Ok(())
}
