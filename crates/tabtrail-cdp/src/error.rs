use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the transport, discovery, and launcher layers.
#[derive(Debug, Error)]
pub enum CdpError {
    #[error("browser endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected http status {status} from {endpoint}")]
    HttpStatus { endpoint: String, status: u16 },
    #[error("cdp i/o failure: {0}")]
    Io(String),
    #[error("cdp command timed out after {0:?}")]
    Timeout(Duration),
    #[error("cdp protocol error {code}: {message}")]
    Protocol { code: i64, message: String },
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("no chrome/chromium executable found")]
    ExecutableNotFound,
}

impl From<reqwest::Error> for CdpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            CdpError::Unreachable(err.to_string())
        } else {
            CdpError::Io(err.to_string())
        }
    }
}
