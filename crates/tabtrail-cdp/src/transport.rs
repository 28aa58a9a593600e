//! Browser-level CDP websocket transport.
//!
//! One instance per websocket connection. Commands funnel through an mpsc
//! control channel into a single loop task that owns the connection;
//! responses come back over per-command oneshot channels keyed by the
//! protocol call id. Protocol events are forwarded to a second channel
//! drained by the session manager. The connection runs in flat session
//! mode: commands optionally carry a CDP session id, and events are
//! demultiplexed by the session id they arrive with.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CdpError;

/// A protocol event as it came off the wire.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Where a command is addressed: the browser itself, or an attached
/// target's session.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

/// Minimal command surface monitors and the control client wire against.
#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, CdpError>;
}

struct ControlMessage {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, CdpError>>,
}

/// Live websocket connection to the browser's debugging endpoint.
pub struct BrowserTransport {
    command_tx: mpsc::Sender<ControlMessage>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    loop_task: JoinHandle<()>,
    alive: Arc<AtomicBool>,
    deadline: Duration,
}

impl BrowserTransport {
    pub async fn connect(ws_url: &str, deadline: Duration) -> Result<Self, CdpError> {
        let conn = Connection::<CdpEventMessage>::connect(ws_url)
            .await
            .map_err(|err| CdpError::Unreachable(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);

        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = Arc::clone(&alive);
        let loop_task = tokio::spawn(async move {
            if let Err(err) = run_loop(conn, command_rx, events_tx).await {
                warn!(target: "tabtrail-cdp", %err, "transport loop terminated");
            }
            loop_alive.store(false, Ordering::Relaxed);
        });

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            loop_task,
            alive,
            deadline,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Next protocol event; `None` once the connection has died.
    pub async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }
}

#[async_trait]
impl CdpTransport for BrowserTransport {
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, CdpError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            target,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(message)
            .await
            .map_err(|err| CdpError::Io(err.to_string()))?;

        match tokio::time::timeout(self.deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::Io("command response channel closed".to_string())),
            Err(_) => Err(CdpError::Timeout(self.deadline)),
        }
    }
}

impl Drop for BrowserTransport {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
    }
}

async fn run_loop(
    mut conn: Connection<CdpEventMessage>,
    mut command_rx: mpsc::Receiver<ControlMessage>,
    events_tx: mpsc::Sender<TransportEvent>,
) -> Result<(), CdpError> {
    let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, CdpError>>> = HashMap::new();

    loop {
        tokio::select! {
            Some(cmd) = command_rx.recv() => {
                submit_command(&mut conn, cmd, &mut inflight)?;
            }
            message = conn.next() => {
                match message {
                    Some(Ok(Message::Response(resp))) => {
                        handle_response(resp, &mut inflight);
                    }
                    Some(Ok(Message::Event(event))) => {
                        forward_event(event, &events_tx).await;
                    }
                    Some(Err(err)) => {
                        let failure = CdpError::Io(err.to_string());
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(CdpError::Io("connection lost".to_string())));
                        }
                        return Err(failure);
                    }
                    None => {
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(CdpError::Io("connection closed".to_string())));
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn submit_command(
    conn: &mut Connection<CdpEventMessage>,
    cmd: ControlMessage,
    inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, CdpError>>>,
) -> Result<(), CdpError> {
    let session = match cmd.target {
        CommandTarget::Browser => None,
        CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
    };

    let method_id: MethodId = cmd.method.clone().into();
    match conn.submit_command(method_id, session, cmd.params) {
        Ok(call_id) => {
            inflight.insert(call_id, cmd.responder);
            Ok(())
        }
        Err(err) => {
            let failure = CdpError::Io(err.to_string());
            let _ = cmd.responder.send(Err(CdpError::Io(err.to_string())));
            Err(failure)
        }
    }
}

fn handle_response(
    resp: Response,
    inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, CdpError>>>,
) {
    let Some(sender) = inflight.remove(&resp.id) else {
        return;
    };

    let result = if let Some(result) = resp.result {
        Ok(result)
    } else if let Some(error) = resp.error {
        Err(CdpError::Protocol {
            code: error.code,
            message: error.message,
        })
    } else {
        Ok(Value::Null)
    };

    let _ = sender.send(result);
}

async fn forward_event(event: CdpEventMessage, events_tx: &mpsc::Sender<TransportEvent>) {
    let raw: CdpJsonEventMessage = match event.try_into() {
        Ok(raw) => raw,
        Err(err) => {
            debug!(target: "tabtrail-cdp", %err, "undecodable cdp event");
            return;
        }
    };

    let payload = TransportEvent {
        method: raw.method.into_owned(),
        params: raw.params,
        session_id: raw.session_id,
    };

    if events_tx.send(payload).await.is_err() {
        debug!(target: "tabtrail-cdp", "event receiver dropped");
    }
}
