//! Process-wide identity and filesystem path derivation.
//!
//! Two values are process-global: the session UUID and the tab counter.
//! Both live behind [`TabRegistry`], constructed once at startup and passed
//! explicitly. TargetID → TabID is a total, injective mapping for every
//! target ever seen; entries may be dropped to bound memory, but a tab id
//! is never reissued.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

use url::Url;
use uuid::Uuid;

/// Site name used when a URL is empty or unparseable.
pub const UNKNOWN_SITE: &str = "unknown";

const MAX_SITE_BYTES: usize = 255;

static SESSION_ID: OnceLock<String> = OnceLock::new();

/// The process-lifetime session id, generated on first use.
pub fn session_id() -> &'static str {
    SESSION_ID.get_or_init(|| Uuid::new_v4().to_string())
}

/// Translation table from browser target ids to stable `tab-N` names.
pub struct TabRegistry {
    session_id: String,
    counter: AtomicU64,
    targets: RwLock<HashMap<String, String>>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self {
            session_id: session_id().to_string(),
            counter: AtomicU64::new(0),
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the tab id for `target_id`, allocating the next `tab-N` on
    /// first encounter. Subsequent lookups return the same name.
    pub fn get_or_create(&self, target_id: &str) -> String {
        if let Some(tab_id) = self
            .targets
            .read()
            .expect("tab registry lock poisoned")
            .get(target_id)
        {
            return tab_id.clone();
        }

        let mut targets = self.targets.write().expect("tab registry lock poisoned");
        if let Some(tab_id) = targets.get(target_id) {
            return tab_id.clone();
        }

        let tab_id = format!("tab-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        targets.insert(target_id.to_string(), tab_id.clone());
        tab_id
    }

    pub fn get(&self, target_id: &str) -> Option<String> {
        self.targets
            .read()
            .expect("tab registry lock poisoned")
            .get(target_id)
            .cloned()
    }

    /// Drops the translation entry. Records already emitted keep their tab
    /// id; the counter never moves backwards.
    pub fn remove(&self, target_id: &str) {
        self.targets
            .write()
            .expect("tab registry lock poisoned")
            .remove(target_id);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Default for TabRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces filesystem-hostile characters and truncates to the common
/// filename limit.
pub fn sanitize_site(raw: &str) -> String {
    if raw.is_empty() {
        return UNKNOWN_SITE.to_string();
    }

    let mut out: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            other => other,
        })
        .collect();

    if out.len() > MAX_SITE_BYTES {
        let mut end = MAX_SITE_BYTES;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }

    out
}

/// Derives the site bucket for a URL.
///
/// Loopback hosts keep their port (`localhost_3000`) so parallel dev
/// servers land in distinct directories; other hosts bucket by hostname
/// alone. Opaque URLs such as `about:blank` bucket by scheme.
pub fn extract_site(raw: &str) -> String {
    if raw.is_empty() {
        return UNKNOWN_SITE.to_string();
    }

    let Ok(url) = Url::parse(raw) else {
        return UNKNOWN_SITE.to_string();
    };

    match url.host_str() {
        Some(host) if !host.is_empty() => {
            if let Some(port) = url.port() {
                if matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0") {
                    return sanitize_site(&format!("{host}_{port}"));
                }
            }
            sanitize_site(host)
        }
        _ => {
            let opaque = if url.cannot_be_a_base() { url.path() } else { "" };
            sanitize_site(&format!("{}_{}", url.scheme(), opaque))
        }
    }
}

/// `<base>/<site>/<tab_id>/session.log`
pub fn log_path(base_dir: &Path, site: &str, tab_id: &str) -> PathBuf {
    base_dir.join(site).join(tab_id).join("session.log")
}
