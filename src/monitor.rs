//! Per-tab CDP subscriber.
//!
//! A monitor owns one target-scoped CDP session and translates the raw
//! page/network/runtime streams into records for the shared log store. Its
//! shutdown is always driven by cancellation from the session manager; it
//! deliberately does not watch for its own target's destruction, so there
//! is exactly one owner of target lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tabtrail_cdp::{CdpTransport, CommandTarget, TransportEvent};
use tabtrail_redact::Redactor;
use tabtrail_store::record::{
    CONSOLE_DEBUG, CONSOLE_ERROR, CONSOLE_INFO, CONSOLE_LOG, CONSOLE_WARN, ERROR_RUNTIME,
    NETWORK_FAILURE, NETWORK_REQUEST, NETWORK_RESPONSE, NETWORK_RESPONSE_BODY,
};
use tabtrail_store::{extract_site, LogStore, Record};

use crate::config::Config;
use crate::remote_object::normalize_remote_object;

/// Response metadata kept between `responseReceived` and `loadingFinished`
/// for bodies we intend to fetch.
struct ResponseInfo {
    url: String,
    mime_type: String,
}

struct TabState {
    site: String,
    url: String,
    title: String,
}

/// Observer for a single browser tab.
pub struct TabMonitor {
    target_id: String,
    tab_id: String,
    session_id: String,
    cdp_session: String,
    started_at: Instant,
    state: RwLock<TabState>,
    tracker: Mutex<HashMap<String, ResponseInfo>>,
    store: Arc<LogStore>,
    redactor: Arc<Redactor>,
    config: Arc<Config>,
    transport: Arc<dyn CdpTransport>,
    cancel: CancellationToken,
}

impl TabMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target_id: &str,
        tab_id: &str,
        site: &str,
        title: &str,
        url: &str,
        session_id: &str,
        cdp_session: String,
        store: Arc<LogStore>,
        redactor: Arc<Redactor>,
        config: Arc<Config>,
        transport: Arc<dyn CdpTransport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target_id: target_id.to_string(),
            tab_id: tab_id.to_string(),
            session_id: session_id.to_string(),
            cdp_session,
            started_at: Instant::now(),
            state: RwLock::new(TabState {
                site: site.to_string(),
                url: url.to_string(),
                title: title.to_string(),
            }),
            tracker: Mutex::new(HashMap::new()),
            store,
            redactor,
            config,
            transport,
            cancel,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub async fn current_site(&self) -> String {
        self.state.read().await.site.clone()
    }

    pub async fn current_url(&self) -> String {
        self.state.read().await.url.clone()
    }

    /// Enables the needed protocol domains, emits `meta.tab_created`, then
    /// dispatches events until cancelled. The wind-down emits
    /// `meta.tab_closed` and seals the tab's current stream.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        if let Err(err) = self.enable_domains().await {
            warn!(target: "monitor", tab = %self.tab_id, %err, "failed to enable cdp domains");
        }

        {
            let state = self.state.read().await;
            self.write(Record::tab_created(
                &state.site,
                &self.tab_id,
                &self.session_id,
                &self.target_id,
                &state.title,
                &state.url,
            ))
            .await;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        self.finish().await;
    }

    async fn enable_domains(&self) -> Result<(), tabtrail_cdp::CdpError> {
        self.send("Page.enable", json!({})).await?;
        self.send("Runtime.enable", json!({})).await?;
        if self.config.enable_network {
            self.send("Network.enable", json!({})).await?;
        }
        Ok(())
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, tabtrail_cdp::CdpError> {
        self.transport
            .send_command(
                CommandTarget::Session(self.cdp_session.clone()),
                method,
                params,
            )
            .await
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event.method.as_str() {
            "Page.frameNavigated" => self.on_frame_navigated(event.params).await,
            "Page.loadEventFired" => {
                if self.config.enable_page {
                    let state = self.state.read().await;
                    self.write(Record::page_load(&state.site, &self.tab_id, &state.url))
                        .await;
                }
            }
            "Page.domContentEventFired" => {
                if self.config.enable_page {
                    let state = self.state.read().await;
                    self.write(Record::page_dom_ready(&state.site, &self.tab_id, &state.url))
                        .await;
                }
            }
            "Network.requestWillBeSent" => self.on_request(event.params).await,
            "Network.responseReceived" => self.on_response(event.params).await,
            "Network.loadingFinished" => self.on_loading_finished(event.params).await,
            "Network.loadingFailed" => self.on_loading_failed(event.params).await,
            "Runtime.consoleAPICalled" => self.on_console(event.params).await,
            "Runtime.exceptionThrown" => self.on_exception(event.params).await,
            other => {
                debug!(target: "monitor", tab = %self.tab_id, method = other, "unhandled cdp event");
            }
        }
    }

    async fn on_frame_navigated(&self, params: Value) {
        let Ok(payload) = serde_json::from_value::<FrameNavigatedParams>(params) else {
            return;
        };

        // Main frame only; sub-frame navigations carry a parent id.
        if payload
            .frame
            .parent_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
        {
            return;
        }

        let url = payload.frame.url;
        let new_site = extract_site(&url);

        // Re-bucket the stream first so the navigation record lands in the
        // new site's file, right after meta.site_entered.
        self.handle_site_change(&new_site, &url).await;

        if self.config.enable_page {
            let state = self.state.read().await;
            self.write(Record::page_navigate(
                &state.site,
                &self.tab_id,
                &url,
                "",
                "navigation",
            ))
            .await;
        }
    }

    /// Site-change procedure. Seals the old stream behind a
    /// `meta.site_changed` marker and opens the new one with
    /// `meta.site_entered`; both are durable before any later event of this
    /// tab is accepted. Returns false when only the URL moved.
    pub async fn handle_site_change(&self, new_site: &str, new_url: &str) -> bool {
        let mut state = self.state.write().await;

        if new_site == state.site {
            state.url = new_url.to_string();
            return false;
        }

        let old_site = state.site.clone();
        self.write(Record::site_changed(
            &old_site,
            &self.tab_id,
            new_site,
            new_url,
        ))
        .await;

        if let Err(err) = self.store.close(&self.tab_id, &old_site).await {
            debug!(target: "monitor", tab = %self.tab_id, %err, "failed to close old site stream");
        }

        state.site = new_site.to_string();
        state.url = new_url.to_string();

        self.write(Record::site_entered(
            new_site,
            &self.tab_id,
            &old_site,
            new_url,
        ))
        .await;

        true
    }

    async fn on_request(&self, params: Value) {
        if !self.config.enable_network {
            return;
        }
        let Ok(payload) = serde_json::from_value::<RequestWillBeSentParams>(params) else {
            return;
        };

        let site = self.current_site().await;
        self.write(Record::new(
            &site,
            &self.tab_id,
            NETWORK_REQUEST,
            data(json!({
                "request_id": payload.request_id,
                "url": payload.request.url,
                "method": payload.request.method,
                "type": payload.resource_type.unwrap_or_default(),
            })),
        ))
        .await;
    }

    async fn on_response(&self, params: Value) {
        if !self.config.enable_network {
            return;
        }
        let Ok(payload) = serde_json::from_value::<ResponseReceivedParams>(params) else {
            return;
        };

        let headers = self.redactor.redact_headers(payload.response.headers);

        let site = self.current_site().await;
        self.write(Record::new(
            &site,
            &self.tab_id,
            NETWORK_RESPONSE,
            data(json!({
                "request_id": payload.request_id,
                "url": payload.response.url,
                "status": payload.response.status,
                "status_text": payload.response.status_text,
                "mime_type": payload.response.mime_type,
                "headers": headers,
                "encoded_length": payload.response.encoded_data_length,
            })),
        ))
        .await;

        if self.config.capture_bodies
            && self.should_capture_body(
                &payload.response.mime_type,
                payload.response.encoded_data_length,
            )
        {
            self.tracker.lock().await.insert(
                payload.request_id,
                ResponseInfo {
                    url: payload.response.url,
                    mime_type: payload.response.mime_type,
                },
            );
        }
    }

    async fn on_loading_finished(self: &Arc<Self>, params: Value) {
        if !self.config.enable_network || !self.config.capture_bodies {
            return;
        }
        let Ok(payload) = serde_json::from_value::<LoadingFinishedParams>(params) else {
            return;
        };

        let info = self.tracker.lock().await.remove(&payload.request_id);
        let Some(info) = info else {
            return;
        };

        // Body retrieval awaits a CDP round trip; keep it off the dispatch
        // path. The fetch dies with the monitor.
        let monitor = Arc::clone(self);
        let token = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = monitor.capture_body(payload.request_id, info) => {}
            }
        });
    }

    async fn capture_body(&self, request_id: String, info: ResponseInfo) {
        let payload = match self
            .send(
                "Network.getResponseBody",
                json!({ "requestId": request_id }),
            )
            .await
        {
            Ok(payload) => payload,
            Err(err) => {
                // The browser's body cache is ephemeral; a miss is normal.
                debug!(target: "monitor", tab = %self.tab_id, %err, "body fetch failed");
                return;
            }
        };

        let body = payload
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let base64_encoded = payload
            .get("base64Encoded")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let body = if base64_encoded {
            body.to_string()
        } else {
            self.redactor.redact_body(body)
        };

        let site = self.current_site().await;
        self.write(Record::new(
            &site,
            &self.tab_id,
            NETWORK_RESPONSE_BODY,
            data(json!({
                "request_id": request_id,
                "url": info.url,
                "mime_type": info.mime_type,
                "base64_encoded": base64_encoded,
                "body": body,
            })),
        ))
        .await;
    }

    async fn on_loading_failed(&self, params: Value) {
        if !self.config.enable_network {
            return;
        }
        let Ok(payload) = serde_json::from_value::<LoadingFailedParams>(params) else {
            return;
        };

        let site = self.current_site().await;
        self.write(Record::new(
            &site,
            &self.tab_id,
            NETWORK_FAILURE,
            data(json!({
                "request_id": payload.request_id,
                "error_text": payload.error_text,
                "canceled": payload.canceled,
                "blocked": payload.blocked_reason.unwrap_or_default(),
                "cors_error": payload.cors_error_status,
            })),
        ))
        .await;
    }

    async fn on_console(&self, params: Value) {
        if !self.config.enable_console {
            return;
        }
        let Ok(payload) = serde_json::from_value::<ConsoleApiCalledParams>(params) else {
            return;
        };

        let event_type = match payload.kind.as_str() {
            "warning" => CONSOLE_WARN,
            "error" => CONSOLE_ERROR,
            "info" => CONSOLE_INFO,
            "debug" => CONSOLE_DEBUG,
            _ => CONSOLE_LOG,
        };

        let args: Vec<Value> = payload.args.iter().map(normalize_remote_object).collect();

        let site = self.current_site().await;
        self.write(Record::new(
            &site,
            &self.tab_id,
            event_type,
            data(json!({ "args": args })),
        ))
        .await;
    }

    async fn on_exception(&self, params: Value) {
        if !self.config.enable_errors {
            return;
        }
        let Ok(payload) = serde_json::from_value::<ExceptionThrownParams>(params) else {
            return;
        };

        let details = payload.exception_details;
        let site = self.current_site().await;
        self.write(Record::new(
            &site,
            &self.tab_id,
            ERROR_RUNTIME,
            data(json!({
                "text": details.text,
                "line": details.line_number,
                "column": details.column_number,
                "url": details.url,
                "script_id": details.script_id,
            })),
        ))
        .await;
    }

    fn should_capture_body(&self, mime_type: &str, size: f64) -> bool {
        let max_size = (self.config.body_size_limit_kb * 1024) as f64;
        if size > max_size && size > 0.0 {
            return false;
        }

        let mime_type = mime_type.to_lowercase();
        self.config
            .body_content_types
            .iter()
            .any(|pattern| match_content_type(&mime_type, pattern))
    }

    async fn finish(&self) {
        let site = self.current_site().await;
        let duration = self.started_at.elapsed().as_secs_f64();

        self.write(Record::tab_closed(
            &site,
            &self.tab_id,
            &self.session_id,
            &self.target_id,
            duration,
        ))
        .await;

        if let Err(err) = self.store.close(&self.tab_id, &site).await {
            debug!(target: "monitor", tab = %self.tab_id, %err, "failed to seal stream on close");
        }
    }

    // Write errors never escape into the event loop; the affected record
    // is dropped and monitoring continues.
    async fn write(&self, record: Record) {
        if let Err(err) = self.store.write(&self.tab_id, &record).await {
            debug!(
                target: "monitor",
                tab = %self.tab_id,
                event = %record.event_type,
                %err,
                "dropped record"
            );
        }
    }
}

/// Matches a MIME type against a pattern, ignoring parameters. Patterns
/// are `type/subtype` exact or `type/*` globs.
fn match_content_type(actual: &str, pattern: &str) -> bool {
    let actual = actual.split(';').next().unwrap_or_default().trim();

    if let Some(prefix) = pattern.strip_suffix("/*") {
        return actual.starts_with(&format!("{prefix}/"));
    }

    actual == pattern
}

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Deserialize)]
struct FrameNavigatedParams {
    frame: FramePayload,
}

#[derive(Deserialize)]
struct FramePayload {
    #[serde(default, rename = "parentId")]
    parent_id: Option<String>,
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct RequestWillBeSentParams {
    #[serde(rename = "requestId")]
    request_id: String,
    request: RequestPayload,
    #[serde(default, rename = "type")]
    resource_type: Option<String>,
}

#[derive(Deserialize)]
struct RequestPayload {
    #[serde(default)]
    url: String,
    #[serde(default)]
    method: String,
}

#[derive(Deserialize)]
struct ResponseReceivedParams {
    #[serde(rename = "requestId")]
    request_id: String,
    response: ResponsePayload,
}

#[derive(Deserialize)]
struct ResponsePayload {
    #[serde(default)]
    url: String,
    #[serde(default)]
    status: i64,
    #[serde(default, rename = "statusText")]
    status_text: String,
    #[serde(default, rename = "mimeType")]
    mime_type: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default, rename = "encodedDataLength")]
    encoded_data_length: f64,
}

#[derive(Deserialize)]
struct LoadingFinishedParams {
    #[serde(rename = "requestId")]
    request_id: String,
}

#[derive(Deserialize)]
struct LoadingFailedParams {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(default, rename = "errorText")]
    error_text: String,
    #[serde(default)]
    canceled: bool,
    #[serde(default, rename = "blockedReason")]
    blocked_reason: Option<String>,
    #[serde(default, rename = "corsErrorStatus")]
    cors_error_status: Option<CorsErrorStatus>,
}

// Serialized whole into `network.failure.cors_error`; absent status
// renders as null.
#[derive(Serialize, Deserialize)]
struct CorsErrorStatus {
    #[serde(rename = "corsError")]
    cors_error: String,
    #[serde(rename = "failedParameter", default)]
    failed_parameter: Option<String>,
}

#[derive(Deserialize)]
struct ConsoleApiCalledParams {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Deserialize)]
struct ExceptionThrownParams {
    #[serde(rename = "exceptionDetails")]
    exception_details: ExceptionDetails,
}

#[derive(Deserialize)]
struct ExceptionDetails {
    #[serde(default)]
    text: String,
    #[serde(default, rename = "lineNumber")]
    line_number: i64,
    #[serde(default, rename = "columnNumber")]
    column_number: i64,
    #[serde(default)]
    url: String,
    #[serde(default, rename = "scriptId")]
    script_id: String,
}
