//! Chrome DevTools Protocol plumbing for the observer.
//!
//! [`transport`] owns the browser-level websocket and the command/response
//! correlation; [`discovery`] speaks the HTTP bootstrap endpoints; and
//! [`launcher`] finds and starts a browser when asked to. Target lifecycle
//! policy lives above this crate, in the session manager.

pub mod discovery;
pub mod launcher;
pub mod transport;

mod error;

pub use error::CdpError;
pub use transport::{BrowserTransport, CdpTransport, CommandTarget, TransportEvent};
