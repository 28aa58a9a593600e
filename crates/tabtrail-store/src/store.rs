//! Concurrent multi-writer log store with the smart-flush discipline.
//!
//! One append-only file per (tab, site), created lazily on first write and
//! held open until an explicit close. Meta records are flushed and fsynced
//! on the spot; ordinary records ride a buffered writer that is drained to
//! the OS when nearly full or by a deferred per-file timer, keeping the
//! stream `tail -f`-able without paying a syscall per event.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::path::log_path;
use crate::record::Record;

/// Default buffer capacity per open file.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default delay before a deferred flush drains the buffer to the OS.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("log i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

type SinkKey = (String, String);

/// Shared store routing records to per-(tab, site) files.
pub struct LogStore {
    base_dir: PathBuf,
    flush_interval: Duration,
    buffer_size: usize,
    sinks: RwLock<HashMap<SinkKey, Arc<LogSink>>>,
}

impl LogStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sinks: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Appends `record` to the file for (`tab_id`, `record.site`), creating
    /// it on first use, then applies the flush policy.
    pub async fn write(&self, tab_id: &str, record: &Record) -> Result<(), StoreError> {
        let sink = self.sink_for(tab_id, &record.site).await?;
        sink.append(record, self.flush_interval).await
    }

    /// Seals and removes the file for one (tab, site) pair. A later write
    /// to the same pair reopens it in append mode.
    pub async fn close(&self, tab_id: &str, site: &str) -> Result<(), StoreError> {
        let sink = self
            .sinks
            .write()
            .await
            .remove(&(tab_id.to_string(), site.to_string()));
        match sink {
            Some(sink) => sink.seal().await,
            None => Ok(()),
        }
    }

    /// Seals every file belonging to `tab_id`, across all sites it visited.
    pub async fn close_all_for_tab(&self, tab_id: &str) -> Result<(), StoreError> {
        let drained: Vec<Arc<LogSink>> = {
            let mut sinks = self.sinks.write().await;
            let keys: Vec<SinkKey> = sinks
                .keys()
                .filter(|(tab, _)| tab == tab_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|key| sinks.remove(&key)).collect()
        };

        let mut result = Ok(());
        for sink in drained {
            if let Err(err) = sink.seal().await {
                result = Err(err);
            }
        }
        result
    }

    /// Seals every open file. Called once on process shutdown.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let drained: Vec<Arc<LogSink>> = {
            let mut sinks = self.sinks.write().await;
            sinks.drain().map(|(_, sink)| sink).collect()
        };

        let mut result = Ok(());
        for sink in drained {
            if let Err(err) = sink.seal().await {
                result = Err(err);
            }
        }
        result
    }

    /// Number of currently open log files.
    pub async fn open_files(&self) -> usize {
        self.sinks.read().await.len()
    }

    async fn sink_for(&self, tab_id: &str, site: &str) -> Result<Arc<LogSink>, StoreError> {
        let key = (tab_id.to_string(), site.to_string());

        if let Some(sink) = self.sinks.read().await.get(&key) {
            return Ok(Arc::clone(sink));
        }

        let mut sinks = self.sinks.write().await;
        if let Some(sink) = sinks.get(&key) {
            return Ok(Arc::clone(sink));
        }

        let path = log_path(&self.base_dir, site, tab_id);
        let sink = Arc::new(LogSink::open(&path, self.buffer_size)?);
        sinks.insert(key, Arc::clone(&sink));
        Ok(sink)
    }
}

struct LogSink {
    inner: Mutex<SinkInner>,
}

struct SinkInner {
    // None once sealed; a timer firing after close sees it and no-ops.
    writer: Option<BufWriter<File>>,
    sync_handle: Option<File>,
    flush_timer: Option<JoinHandle<()>>,
}

impl SinkInner {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
    }
}

impl LogSink {
    fn open(path: &Path, buffer_size: usize) -> Result<Self, StoreError> {
        // 0755 dirs / 0644 files, independent of the process umask.
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, fs::Permissions::from_mode(0o755))?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        let file = options.open(path)?;
        let sync_handle = file.try_clone()?;

        Ok(Self {
            inner: Mutex::new(SinkInner {
                writer: Some(BufWriter::with_capacity(buffer_size, file)),
                sync_handle: Some(sync_handle),
                flush_timer: None,
            }),
        })
    }

    async fn append(self: &Arc<Self>, record: &Record, interval: Duration) -> Result<(), StoreError> {
        let line = serde_json::to_vec(record)?;

        let mut inner = self.inner.lock().await;
        {
            let writer = match inner.writer.as_mut() {
                Some(writer) => writer,
                None => return Ok(()),
            };
            writer.write_all(&line)?;
            writer.write_all(b"\n")?;
        }

        if record.is_meta() {
            // Lifecycle markers must survive a crash.
            if let Some(writer) = inner.writer.as_mut() {
                writer.flush()?;
            }
            if let Some(handle) = inner.sync_handle.as_ref() {
                handle.sync_all()?;
            }
            inner.cancel_timer();
            return Ok(());
        }

        let nearly_full = inner
            .writer
            .as_ref()
            .map(|writer| writer.buffer().len() > writer.capacity() * 3 / 4)
            .unwrap_or(false);

        if nearly_full {
            if let Some(writer) = inner.writer.as_mut() {
                writer.flush()?;
            }
            inner.cancel_timer();
        } else if inner.flush_timer.is_none() {
            let sink = Arc::clone(self);
            inner.flush_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                let mut inner = sink.inner.lock().await;
                if let Some(writer) = inner.writer.as_mut() {
                    if let Err(err) = writer.flush() {
                        debug!(target: "tabtrail-store", %err, "deferred flush failed");
                    }
                }
                inner.flush_timer = None;
            }));
        }

        Ok(())
    }

    async fn seal(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.cancel_timer();

        if let Some(mut writer) = inner.writer.take() {
            writer.flush()?;
        }
        if let Some(handle) = inner.sync_handle.take() {
            handle.sync_all()?;
        }
        Ok(())
    }
}
