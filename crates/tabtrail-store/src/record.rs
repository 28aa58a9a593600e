//! The uniform record shape written to every log stream.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Meta event types. Lifecycle-critical: the store fsyncs these on write.
pub const META_SESSION_START: &str = "meta.session_start";
pub const META_TAB_CREATED: &str = "meta.tab_created";
pub const META_TAB_CLOSED: &str = "meta.tab_closed";
pub const META_SITE_CHANGED: &str = "meta.site_changed";
pub const META_SITE_ENTERED: &str = "meta.site_entered";

/// Page event types.
pub const PAGE_NAVIGATE: &str = "page.navigate";
pub const PAGE_LOAD: &str = "page.load";
pub const PAGE_DOM_READY: &str = "page.dom_ready";

/// Network event types.
pub const NETWORK_REQUEST: &str = "network.request";
pub const NETWORK_RESPONSE: &str = "network.response";
pub const NETWORK_RESPONSE_BODY: &str = "network.response_body";
pub const NETWORK_FAILURE: &str = "network.failure";

/// Console event types.
pub const CONSOLE_LOG: &str = "console.log";
pub const CONSOLE_WARN: &str = "console.warn";
pub const CONSOLE_INFO: &str = "console.info";
pub const CONSOLE_ERROR: &str = "console.error";
pub const CONSOLE_DEBUG: &str = "console.debug";

/// Error event types.
pub const ERROR_RUNTIME: &str = "error.runtime";

/// Site and tab id used for session-scoped records.
pub const META_SITE: &str = "_meta";
pub const SESSION_TAB: &str = "_session";

/// One observed event, serialized as a single JSON line. Records are
/// immutable once constructed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: String,
    pub site: String,
    pub tab_id: String,
    pub event_type: String,
    pub data: Map<String, Value>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Record {
    pub fn new(site: &str, tab_id: &str, event_type: &str, data: Map<String, Value>) -> Self {
        Self {
            timestamp: now_rfc3339(),
            site: site.to_string(),
            tab_id: tab_id.to_string(),
            event_type: event_type.to_string(),
            data,
        }
    }

    /// Whether this record is lifecycle-critical and must be made durable
    /// immediately.
    pub fn is_meta(&self) -> bool {
        self.event_type.starts_with("meta.")
    }

    pub fn session_start(session_id: &str, browser_pid: u32, tool_version: &str) -> Self {
        Self::new(
            META_SITE,
            SESSION_TAB,
            META_SESSION_START,
            object(json!({
                "session_id": session_id,
                "browser_pid": browser_pid,
                "tool_version": tool_version,
                "start_time": now_rfc3339(),
            })),
        )
    }

    pub fn tab_created(
        site: &str,
        tab_id: &str,
        session_id: &str,
        target_id: &str,
        title: &str,
        url: &str,
    ) -> Self {
        Self::new(
            site,
            tab_id,
            META_TAB_CREATED,
            object(json!({
                "session_id": session_id,
                "target_id": target_id,
                "title": title,
                "url": url,
            })),
        )
    }

    pub fn tab_closed(
        site: &str,
        tab_id: &str,
        session_id: &str,
        target_id: &str,
        duration_seconds: f64,
    ) -> Self {
        Self::new(
            site,
            tab_id,
            META_TAB_CLOSED,
            object(json!({
                "session_id": session_id,
                "target_id": target_id,
                "duration_seconds": duration_seconds,
            })),
        )
    }

    /// Written to the old site's stream as its final record.
    pub fn site_changed(old_site: &str, tab_id: &str, new_site: &str, new_url: &str) -> Self {
        Self::new(
            old_site,
            tab_id,
            META_SITE_CHANGED,
            object(json!({
                "old_site": old_site,
                "new_site": new_site,
                "new_url": new_url,
            })),
        )
    }

    /// Written to the new site's stream as its first record for the tab.
    pub fn site_entered(site: &str, tab_id: &str, from_site: &str, url: &str) -> Self {
        Self::new(
            site,
            tab_id,
            META_SITE_ENTERED,
            object(json!({
                "from_site": from_site,
                "url": url,
            })),
        )
    }

    pub fn page_navigate(
        site: &str,
        tab_id: &str,
        url: &str,
        referrer: &str,
        navigation_type: &str,
    ) -> Self {
        Self::new(
            site,
            tab_id,
            PAGE_NAVIGATE,
            object(json!({
                "url": url,
                "referrer": referrer,
                "navigation_type": navigation_type,
            })),
        )
    }

    pub fn page_load(site: &str, tab_id: &str, url: &str) -> Self {
        Self::new(site, tab_id, PAGE_LOAD, object(json!({ "url": url })))
    }

    pub fn page_dom_ready(site: &str, tab_id: &str, url: &str) -> Self {
        Self::new(site, tab_id, PAGE_DOM_READY, object(json!({ "url": url })))
    }
}
