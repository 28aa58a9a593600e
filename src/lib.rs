//! tabtrail observes a user-driven Chrome/Chromium session over the
//! DevTools protocol and appends one JSONL stream per (site, tab). It
//! never interferes with the page; the `control` subcommand is a separate
//! short-lived client for imperative automation.

pub mod config;
pub mod control;
pub mod monitor;
pub mod remote_object;
pub mod session;
