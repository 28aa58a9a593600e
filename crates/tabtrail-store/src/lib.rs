//! Identity, record schema, and the append-only JSONL log store.
//!
//! Everything the observer writes flows through here: stable tab naming
//! ([`path::TabRegistry`]), URL → site bucketing ([`path::extract_site`]),
//! the uniform five-field record ([`record::Record`]), and the buffered
//! multi-writer store with per-event-class flush semantics
//! ([`store::LogStore`]).

pub mod path;
pub mod record;
pub mod store;

pub use path::{extract_site, log_path, sanitize_site, session_id, TabRegistry, UNKNOWN_SITE};
pub use record::Record;
pub use store::{LogStore, StoreError, DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_INTERVAL};
