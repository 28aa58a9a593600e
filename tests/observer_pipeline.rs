//! Pipeline tests driving a tab monitor with synthetic CDP events over a
//! stub transport, asserting on the JSONL streams it produces.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tabtrail::config::Config;
use tabtrail::monitor::TabMonitor;
use tabtrail_cdp::{CdpError, CdpTransport, CommandTarget, TransportEvent};
use tabtrail_redact::Redactor;
use tabtrail_store::{extract_site, LogStore};

struct StubTransport {
    bodies: HashMap<String, Value>,
}

#[async_trait]
impl CdpTransport for StubTransport {
    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, CdpError> {
        match method {
            "Network.getResponseBody" => {
                let id = params
                    .get("requestId")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.bodies
                    .get(id)
                    .cloned()
                    .ok_or_else(|| CdpError::Io("body evicted".to_string()))
            }
            _ => Ok(json!({})),
        }
    }
}

struct Harness {
    monitor: Arc<TabMonitor>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    dir: TempDir,
}

impl Harness {
    async fn start(config: Config, bodies: HashMap<String, Value>, url: &str) -> Self {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            LogStore::new(dir.path().to_path_buf())
                .with_flush_interval(Duration::from_millis(20)),
        );
        let redactor = Arc::new(Redactor::new(config.redact));
        let transport: Arc<dyn CdpTransport> = Arc::new(StubTransport { bodies });
        let cancel = CancellationToken::new();
        let site = extract_site(url);

        let monitor = Arc::new(TabMonitor::new(
            "TARGET-1",
            "tab-1",
            &site,
            "Example",
            url,
            "session-under-test",
            "SESSION-1".to_string(),
            store,
            redactor,
            Arc::new(config),
            transport,
            cancel.clone(),
        ));

        let (events, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Arc::clone(&monitor).run(events_rx));

        Self {
            monitor,
            events,
            cancel,
            task,
            dir,
        }
    }

    fn send(&self, method: &str, params: Value) {
        self.events
            .send(TransportEvent {
                method: method.to_string(),
                params,
                session_id: Some("SESSION-1".to_string()),
            })
            .unwrap();
    }

    async fn finish(self) -> TempDir {
        // Let queued events drain before winding the monitor down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.cancel.cancel();
        self.task.await.unwrap();
        self.dir
    }
}

fn read_lines(path: &Path) -> Vec<Value> {
    let raw = std::fs::read_to_string(path).unwrap_or_default();
    raw.lines()
        .map(|line| serde_json::from_str(line).expect("valid JSON line"))
        .collect()
}

fn event_types(lines: &[Value]) -> Vec<String> {
    lines
        .iter()
        .map(|l| l["event_type"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn single_navigation_produces_created_navigate_load() {
    let h = Harness::start(Config::default(), HashMap::new(), "https://example.com/").await;

    h.send(
        "Page.frameNavigated",
        json!({ "frame": { "id": "F1", "url": "https://example.com/" } }),
    );
    h.send("Page.loadEventFired", json!({ "timestamp": 1.0 }));

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));

    assert_eq!(
        event_types(&lines),
        ["meta.tab_created", "page.navigate", "page.load", "meta.tab_closed"]
    );
    assert_eq!(lines[0]["data"]["url"], "https://example.com/");
    assert_eq!(lines[1]["data"]["url"], "https://example.com/");
    assert_eq!(lines[2]["data"]["url"], "https://example.com/");
    // Every record in this file belongs to this (tab, site).
    for line in &lines {
        assert_eq!(line["site"], "example.com");
        assert_eq!(line["tab_id"], "tab-1");
    }
}

#[tokio::test]
async fn site_change_seals_the_old_stream_and_opens_the_new() {
    let h = Harness::start(Config::default(), HashMap::new(), "https://example.com/").await;

    h.send(
        "Page.frameNavigated",
        json!({ "frame": { "id": "F1", "url": "https://example.com/" } }),
    );
    h.send(
        "Page.frameNavigated",
        json!({ "frame": { "id": "F1", "url": "https://github.com/x" } }),
    );

    let dir = h.finish().await;

    let old = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    let last = old.last().unwrap();
    assert_eq!(last["event_type"], "meta.site_changed");
    assert_eq!(last["data"]["old_site"], "example.com");
    assert_eq!(last["data"]["new_site"], "github.com");
    assert_eq!(last["data"]["new_url"], "https://github.com/x");

    let new = read_lines(&dir.path().join("github.com/tab-1/session.log"));
    assert_eq!(new[0]["event_type"], "meta.site_entered");
    assert_eq!(new[0]["data"]["from_site"], "example.com");
    assert_eq!(new[0]["data"]["url"], "https://github.com/x");
    assert_eq!(new[1]["event_type"], "page.navigate");
    assert_eq!(new[1]["site"], "github.com");
}

#[tokio::test]
async fn same_site_navigation_does_not_rebucket() {
    let h = Harness::start(Config::default(), HashMap::new(), "https://example.com/").await;

    h.send(
        "Page.frameNavigated",
        json!({ "frame": { "id": "F1", "url": "https://example.com/about" } }),
    );

    let monitor = Arc::clone(&h.monitor);
    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    assert!(!event_types(&lines).contains(&"meta.site_changed".to_string()));
    assert_eq!(monitor.current_url().await, "https://example.com/about");
    assert_eq!(monitor.current_site().await, "example.com");
}

#[tokio::test]
async fn subframe_navigation_is_ignored() {
    let h = Harness::start(Config::default(), HashMap::new(), "https://example.com/").await;

    h.send(
        "Page.frameNavigated",
        json!({ "frame": { "id": "F2", "parentId": "F1", "url": "https://ads.example.net/" } }),
    );

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    assert_eq!(event_types(&lines), ["meta.tab_created", "meta.tab_closed"]);
}

#[tokio::test]
async fn localhost_with_port_gets_its_own_bucket() {
    let h = Harness::start(Config::default(), HashMap::new(), "about:blank").await;

    h.send(
        "Page.frameNavigated",
        json!({ "frame": { "id": "F1", "url": "http://localhost:3000/api" } }),
    );

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("localhost_3000/tab-1/session.log"));
    assert_eq!(lines[0]["event_type"], "meta.site_entered");
    assert_eq!(lines[0]["site"], "localhost_3000");
}

#[tokio::test]
async fn response_headers_are_redacted_and_bodies_captured() {
    let mut config = Config::default();
    config.capture_bodies = true;

    let mut bodies = HashMap::new();
    bodies.insert(
        "R1".to_string(),
        json!({ "body": r#"{"password":"p","ok":true}"#, "base64Encoded": false }),
    );

    let h = Harness::start(config, bodies, "https://example.com/").await;

    h.send(
        "Network.requestWillBeSent",
        json!({
            "requestId": "R1",
            "request": { "url": "https://example.com/api", "method": "POST" },
            "type": "XHR"
        }),
    );
    h.send(
        "Network.responseReceived",
        json!({
            "requestId": "R1",
            "response": {
                "url": "https://example.com/api",
                "status": 200,
                "statusText": "OK",
                "mimeType": "application/json",
                "headers": { "Set-Cookie": "s=abc", "Content-Type": "text/plain" },
                "encodedDataLength": 120.0
            }
        }),
    );
    h.send("Network.loadingFinished", json!({ "requestId": "R1" }));

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    let types = event_types(&lines);

    // request precedes response precedes body for the same request id.
    let request_at = types.iter().position(|t| t == "network.request").unwrap();
    let response_at = types.iter().position(|t| t == "network.response").unwrap();
    let body_at = types
        .iter()
        .position(|t| t == "network.response_body")
        .unwrap();
    assert!(request_at < response_at && response_at < body_at);

    let response = &lines[response_at];
    assert_eq!(response["data"]["headers"]["Set-Cookie"], "[REDACTED]");
    assert_eq!(response["data"]["headers"]["Content-Type"], "text/plain");
    assert_eq!(response["data"]["status"], 200);

    let body = &lines[body_at];
    assert_eq!(body["data"]["request_id"], "R1");
    assert!(!body["data"]["base64_encoded"].as_bool().unwrap());
    let parsed: Value = serde_json::from_str(body["data"]["body"].as_str().unwrap()).unwrap();
    assert_eq!(parsed, json!({ "password": "[REDACTED]", "ok": true }));
}

#[tokio::test]
async fn oversized_and_unmatched_bodies_are_not_captured() {
    let mut config = Config::default();
    config.capture_bodies = true;

    let mut bodies = HashMap::new();
    bodies.insert("BIG".to_string(), json!({ "body": "x", "base64Encoded": false }));
    bodies.insert("BIN".to_string(), json!({ "body": "x", "base64Encoded": false }));
    bodies.insert("NOMIME".to_string(), json!({ "body": "x", "base64Encoded": false }));

    let h = Harness::start(config, bodies, "https://example.com/").await;

    // Over the 10 KB default limit.
    h.send(
        "Network.responseReceived",
        json!({
            "requestId": "BIG",
            "response": {
                "url": "https://example.com/big",
                "status": 200,
                "mimeType": "application/json",
                "headers": {},
                "encodedDataLength": 20_000.0
            }
        }),
    );
    // MIME outside the configured patterns.
    h.send(
        "Network.responseReceived",
        json!({
            "requestId": "BIN",
            "response": {
                "url": "https://example.com/img",
                "status": 200,
                "mimeType": "image/png",
                "headers": {},
                "encodedDataLength": 100.0
            }
        }),
    );
    // Missing MIME never matches.
    h.send(
        "Network.responseReceived",
        json!({
            "requestId": "NOMIME",
            "response": {
                "url": "https://example.com/none",
                "status": 200,
                "headers": {},
                "encodedDataLength": 0.0
            }
        }),
    );
    for id in ["BIG", "BIN", "NOMIME"] {
        h.send("Network.loadingFinished", json!({ "requestId": id }));
    }

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    assert!(!event_types(&lines).contains(&"network.response_body".to_string()));
}

#[tokio::test]
async fn zero_size_responses_with_matching_mime_are_captured() {
    let mut config = Config::default();
    config.capture_bodies = true;

    let mut bodies = HashMap::new();
    bodies.insert(
        "R0".to_string(),
        json!({ "body": "streamed", "base64Encoded": false }),
    );

    let h = Harness::start(config, bodies, "https://example.com/").await;
    h.send(
        "Network.responseReceived",
        json!({
            "requestId": "R0",
            "response": {
                "url": "https://example.com/stream",
                "status": 200,
                "mimeType": "text/plain",
                "headers": {},
                "encodedDataLength": 0.0
            }
        }),
    );
    h.send("Network.loadingFinished", json!({ "requestId": "R0" }));

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    assert!(event_types(&lines).contains(&"network.response_body".to_string()));
}

#[tokio::test]
async fn network_failures_are_recorded() {
    let h = Harness::start(Config::default(), HashMap::new(), "https://example.com/").await;

    h.send(
        "Network.loadingFailed",
        json!({
            "requestId": "R9",
            "errorText": "net::ERR_FAILED",
            "canceled": false,
            "blockedReason": "csp",
            "corsErrorStatus": {
                "corsError": "MissingAllowOriginHeader",
                "failedParameter": "Access-Control-Allow-Origin"
            }
        }),
    );
    h.send(
        "Network.loadingFailed",
        json!({
            "requestId": "R10",
            "errorText": "net::ERR_CONNECTION_REFUSED",
            "canceled": true
        }),
    );

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));

    let cors_failure = lines
        .iter()
        .find(|l| l["data"]["request_id"] == "R9")
        .unwrap();
    assert_eq!(cors_failure["event_type"], "network.failure");
    assert_eq!(cors_failure["data"]["error_text"], "net::ERR_FAILED");
    assert_eq!(cors_failure["data"]["blocked"], "csp");
    // The CORS status round-trips as a structure, not a flattened string.
    assert_eq!(
        cors_failure["data"]["cors_error"],
        json!({
            "corsError": "MissingAllowOriginHeader",
            "failedParameter": "Access-Control-Allow-Origin"
        })
    );

    let plain_failure = lines
        .iter()
        .find(|l| l["data"]["request_id"] == "R10")
        .unwrap();
    assert_eq!(plain_failure["data"]["error_text"], "net::ERR_CONNECTION_REFUSED");
    assert_eq!(plain_failure["data"]["canceled"], true);
    assert_eq!(plain_failure["data"]["blocked"], "");
    assert_eq!(plain_failure["data"]["cors_error"], Value::Null);
}

#[tokio::test]
async fn console_methods_map_to_event_types() {
    let h = Harness::start(Config::default(), HashMap::new(), "https://example.com/").await;

    for kind in ["log", "warning", "error", "info", "debug"] {
        h.send(
            "Runtime.consoleAPICalled",
            json!({
                "type": kind,
                "args": [
                    { "type": "string", "value": "msg" },
                    { "type": "number", "value": 7 },
                    { "type": "undefined" }
                ]
            }),
        );
    }

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    let types = event_types(&lines);

    for expected in [
        "console.log",
        "console.warn",
        "console.error",
        "console.info",
        "console.debug",
    ] {
        assert!(types.contains(&expected.to_string()), "missing {expected}");
    }

    let first = lines
        .iter()
        .find(|l| l["event_type"] == "console.log")
        .unwrap();
    assert_eq!(first["data"]["args"], json!(["msg", 7, "undefined"]));
}

#[tokio::test]
async fn runtime_exceptions_become_error_records() {
    let h = Harness::start(Config::default(), HashMap::new(), "https://example.com/").await;

    h.send(
        "Runtime.exceptionThrown",
        json!({
            "exceptionDetails": {
                "text": "Uncaught TypeError",
                "lineNumber": 12,
                "columnNumber": 4,
                "url": "https://example.com/app.js",
                "scriptId": "33"
            }
        }),
    );

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    let error = lines
        .iter()
        .find(|l| l["event_type"] == "error.runtime")
        .unwrap();
    assert_eq!(error["data"]["text"], "Uncaught TypeError");
    assert_eq!(error["data"]["line"], 12);
    assert_eq!(error["data"]["column"], 4);
    assert_eq!(error["data"]["script_id"], "33");
}

#[tokio::test]
async fn disabled_categories_suppress_their_records() {
    let mut config = Config::default();
    config.enable_console = false;
    config.enable_network = false;

    let h = Harness::start(config, HashMap::new(), "https://example.com/").await;
    h.send(
        "Runtime.consoleAPICalled",
        json!({ "type": "log", "args": [{ "type": "string", "value": "hidden" }] }),
    );
    h.send(
        "Network.requestWillBeSent",
        json!({ "requestId": "R1", "request": { "url": "https://x/", "method": "GET" } }),
    );

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    assert_eq!(event_types(&lines), ["meta.tab_created", "meta.tab_closed"]);
}

#[tokio::test]
async fn tab_close_is_the_final_record_with_positive_duration() {
    let h = Harness::start(Config::default(), HashMap::new(), "https://example.com/").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let dir = h.finish().await;
    let lines = read_lines(&dir.path().join("example.com/tab-1/session.log"));
    let last = lines.last().unwrap();
    assert_eq!(last["event_type"], "meta.tab_closed");
    assert!(last["data"]["duration_seconds"].as_f64().unwrap() > 0.0);
    assert_eq!(last["data"]["target_id"], "TARGET-1");
}
