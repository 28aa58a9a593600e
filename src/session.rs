//! Browser connection and tab-monitor lifecycle.
//!
//! The manager owns the single browser-level CDP connection and the map of
//! live monitors. Target lifecycle is observed here and nowhere else: a
//! monitor never reacts to its own target's destruction, it is cancelled
//! from this module. On connection loss every monitor is wound down and
//! the manager retries with backoff until it is cancelled from outside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tabtrail_cdp::discovery::{self, TARGET_TYPE_PAGE};
use tabtrail_cdp::launcher::{self, BrowserProcess};
use tabtrail_cdp::{BrowserTransport, CdpError, CdpTransport, CommandTarget, TransportEvent};
use tabtrail_redact::Redactor;
use tabtrail_store::record::SESSION_TAB;
use tabtrail_store::{extract_site, LogStore, Record, TabRegistry};

use crate::config::{Config, VERSION};
use crate::monitor::TabMonitor;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RECONNECT_WAIT: Duration = Duration::from_secs(30);
const STARTUP_WAIT: Duration = Duration::from_secs(30);
const COMMAND_DEADLINE: Duration = Duration::from_secs(30);

/// Orchestrates the CDP connection and the per-tab monitors.
pub struct SessionManager {
    config: Arc<Config>,
    store: Arc<LogStore>,
    redactor: Arc<Redactor>,
    registry: TabRegistry,
    monitors: RwLock<HashMap<String, MonitorHandle>>,
    sessions: RwLock<HashMap<String, String>>,
    connected: AtomicBool,
    browser: Mutex<Option<BrowserProcess>>,
}

struct MonitorHandle {
    monitor: Arc<TabMonitor>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, store: Arc<LogStore>) -> Self {
        let redactor = Arc::new(Redactor::with_custom_rules(
            config.redact,
            &config.redact_headers,
            &config.redact_body_fields,
        ));

        Self {
            config,
            store,
            redactor,
            registry: TabRegistry::new(),
            monitors: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            browser: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        self.registry.session_id()
    }

    pub async fn active_tab_count(&self) -> usize {
        self.monitors.read().await.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Runs until `cancel` fires. Launch failures are fatal; an
    /// unreachable browser in attach mode is retried forever.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.config.auto_launch {
            let process = launcher::launch(self.config.chrome_port)
                .await
                .context("failed to launch browser")?;
            info!(target: "session", pid = process.pid(), "auto-launched browser");
            *self.browser.lock().await = Some(process);

            discovery::wait_for_browser(self.config.chrome_port, STARTUP_WAIT)
                .await
                .context("browser did not become ready")?;
        }

        // The store fsyncs meta records, so the session marker is durable
        // before the first monitor starts.
        let browser_pid = self
            .browser
            .lock()
            .await
            .as_ref()
            .map(|p| p.pid())
            .unwrap_or(0);
        let start = Record::session_start(self.registry.session_id(), browser_pid, VERSION);
        if let Err(err) = self.store.write(SESSION_TAB, &start).await {
            warn!(target: "session", %err, "failed to write session start record");
        }

        let mut retry = RECONNECT_INTERVAL;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.connect(&cancel).await {
                Ok((transport, conn_cancel, anchor)) => {
                    retry = RECONNECT_INTERVAL;
                    self.connected.store(true, Ordering::Relaxed);
                    info!(
                        target: "session",
                        session = %self.registry.session_id(),
                        "monitoring started"
                    );

                    self.pump(&transport, &cancel, &conn_cancel, &anchor).await;

                    self.connected.store(false, Ordering::Relaxed);
                    conn_cancel.cancel();
                    self.teardown_monitors().await;

                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(target: "session", wait = ?retry, "browser disconnected, will retry");
                }
                Err(err) => {
                    info!(target: "session", %err, wait = ?retry, "browser not reachable, will retry");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(retry) => {}
            }
            retry = (retry * 2).min(MAX_RECONNECT_WAIT);
        }

        self.shutdown().await;
        Ok(())
    }

    /// One-shot HTTP enumeration, websocket connect, target discovery, and
    /// monitor startup for pre-existing tabs.
    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Arc<BrowserTransport>, CancellationToken, String), CdpError> {
        let port = self.config.chrome_port;

        let initial = discovery::page_targets(port).await?;
        info!(target: "session", count = initial.len(), "discovered existing tabs");

        let info = discovery::browser_info(port).await?;
        let transport = Arc::new(
            BrowserTransport::connect(&info.web_socket_debugger_url, COMMAND_DEADLINE).await?,
        );

        transport
            .send_command(
                CommandTarget::Browser,
                "Target.setDiscoverTargets",
                json!({ "discover": true }),
            )
            .await?;

        // Our own anchor tab; it must never surface as a user tab.
        let created = transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank" }),
            )
            .await?;
        let anchor = created
            .get("targetId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        info!(target: "session", anchor = %short_id(&anchor), "using internal anchor tab");

        let conn_cancel = cancel.child_token();

        for target in initial {
            if target.id != anchor {
                self.start_monitor(&transport, &conn_cancel, &target.id, &target.title, &target.url)
                    .await;
            }
        }

        Ok((transport, conn_cancel, anchor))
    }

    /// Drains transport events until the connection dies or we are
    /// cancelled.
    async fn pump(
        &self,
        transport: &Arc<BrowserTransport>,
        cancel: &CancellationToken,
        conn_cancel: &CancellationToken,
        anchor: &str,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Best effort: take our anchor tab with us.
                    let _ = transport
                        .send_command(
                            CommandTarget::Browser,
                            "Target.closeTarget",
                            json!({ "targetId": anchor }),
                        )
                        .await;
                    break;
                }
                event = transport.next_event() => {
                    match event {
                        Some(event) => {
                            self.route_event(transport, conn_cancel, anchor, event).await;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn route_event(
        &self,
        transport: &Arc<BrowserTransport>,
        conn_cancel: &CancellationToken,
        anchor: &str,
        event: TransportEvent,
    ) {
        // Session-scoped events belong to exactly one monitor.
        if let Some(session_id) = event.session_id.clone() {
            let target_id = self.sessions.read().await.get(&session_id).cloned();
            if let Some(target_id) = target_id {
                let monitors = self.monitors.read().await;
                if let Some(handle) = monitors.get(&target_id) {
                    let _ = handle.events.send(event);
                }
            }
            return;
        }

        match event.method.as_str() {
            "Target.targetCreated" => {
                let Ok(payload) = serde_json::from_value::<TargetCreatedParams>(event.params)
                else {
                    return;
                };
                let target = payload.target_info;
                if target.kind == TARGET_TYPE_PAGE && target.target_id != anchor {
                    self.start_monitor(
                        transport,
                        conn_cancel,
                        &target.target_id,
                        &target.title,
                        &target.url,
                    )
                    .await;
                }
            }
            "Target.targetDestroyed" => {
                let Ok(payload) = serde_json::from_value::<TargetDestroyedParams>(event.params)
                else {
                    return;
                };
                if payload.target_id != anchor {
                    self.stop_monitor(&payload.target_id).await;
                }
            }
            "Target.targetInfoChanged" => {
                let Ok(payload) = serde_json::from_value::<TargetInfoChangedParams>(event.params)
                else {
                    return;
                };
                let target = payload.target_info;
                if target.kind == TARGET_TYPE_PAGE && target.target_id != anchor {
                    let monitor = {
                        let monitors = self.monitors.read().await;
                        monitors.get(&target.target_id).map(|h| Arc::clone(&h.monitor))
                    };
                    if let Some(monitor) = monitor {
                        let site = extract_site(&target.url);
                        if monitor.handle_site_change(&site, &target.url).await {
                            info!(
                                target: "session",
                                tab = %monitor.tab_id(),
                                site = %site,
                                "tab navigated to new site"
                            );
                        }
                    }
                }
            }
            _ => {}
        }
    }

    async fn start_monitor(
        &self,
        transport: &Arc<BrowserTransport>,
        conn_cancel: &CancellationToken,
        target_id: &str,
        title: &str,
        url: &str,
    ) {
        // Duplicate targetCreated notifications are idempotent.
        if self.monitors.read().await.contains_key(target_id) {
            return;
        }

        let attached = transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await;

        let cdp_session = match attached {
            Ok(value) => match value.get("sessionId").and_then(Value::as_str) {
                Some(session) => session.to_string(),
                None => {
                    warn!(target: "session", target_id = %short_id(target_id), "attach returned no session id");
                    return;
                }
            },
            Err(err) => {
                warn!(target: "session", target_id = %short_id(target_id), %err, "failed to attach to target");
                return;
            }
        };

        let tab_id = self.registry.get_or_create(target_id);
        let site = extract_site(url);
        let cancel = conn_cancel.child_token();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let monitor = Arc::new(TabMonitor::new(
            target_id,
            &tab_id,
            &site,
            title,
            url,
            self.registry.session_id(),
            cdp_session.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.redactor),
            Arc::clone(&self.config),
            Arc::clone(transport) as Arc<dyn CdpTransport>,
            cancel.clone(),
        ));

        let task = tokio::spawn(Arc::clone(&monitor).run(events_rx));

        self.sessions
            .write()
            .await
            .insert(cdp_session, target_id.to_string());
        self.monitors.write().await.insert(
            target_id.to_string(),
            MonitorHandle {
                monitor,
                events: events_tx,
                cancel,
                task,
            },
        );

        info!(
            target: "session",
            tab = %tab_id,
            target_id = %short_id(target_id),
            url,
            "started monitoring tab"
        );
    }

    async fn stop_monitor(&self, target_id: &str) {
        let handle = self.monitors.write().await.remove(target_id);
        let Some(handle) = handle else {
            // Destruction of an unknown target is ignored.
            return;
        };

        self.sessions.write().await.retain(|_, t| t != target_id);

        handle.cancel.cancel();
        // The monitor seals its stream on the way out; the destruction is
        // acknowledged only after that completes.
        if let Err(err) = handle.task.await {
            debug!(target: "session", %err, "monitor task ended abnormally");
        }

        info!(target: "session", tab = %handle.monitor.tab_id(), "tab closed");
    }

    async fn teardown_monitors(&self) {
        let drained: Vec<MonitorHandle> = {
            let mut monitors = self.monitors.write().await;
            monitors.drain().map(|(_, handle)| handle).collect()
        };
        self.sessions.write().await.clear();

        for handle in drained {
            handle.cancel.cancel();
            if let Err(err) = handle.task.await {
                debug!(target: "session", %err, "monitor task ended abnormally");
            }
        }
    }

    async fn shutdown(&self) {
        self.teardown_monitors().await;

        if let Err(err) = self.store.shutdown().await {
            warn!(target: "session", %err, "error sealing log files");
        }

        if let Some(process) = self.browser.lock().await.take() {
            if let Err(err) = process.stop().await {
                warn!(target: "session", %err, "error stopping launched browser");
            }
        }

        info!(target: "session", "shutdown complete");
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[derive(Deserialize)]
struct TargetCreatedParams {
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Deserialize)]
struct TargetDestroyedParams {
    #[serde(rename = "targetId")]
    target_id: String,
}

#[derive(Deserialize)]
struct TargetInfoChangedParams {
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Deserialize)]
struct TargetInfoPayload {
    #[serde(rename = "targetId")]
    target_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
}
