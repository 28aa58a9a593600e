//! Imperative automation client.
//!
//! A short-lived CDP session, independent of the observer: it attaches to
//! the first open page, performs one action, and exits. It shares no state
//! with the monitoring pipeline.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

use tabtrail_cdp::{discovery, BrowserTransport, CdpTransport, CommandTarget};

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Controller {
    transport: BrowserTransport,
    session: String,
    timeout: Duration,
}

impl Controller {
    /// Connects to the browser on `port` and attaches to its first open
    /// page.
    pub async fn connect(port: u16, timeout: Duration) -> Result<Self> {
        let targets = discovery::page_targets(port)
            .await
            .with_context(|| format!("browser not reachable on port {port}"))?;
        let target = targets
            .first()
            .ok_or_else(|| anyhow!("no open page to control"))?;

        let info = discovery::browser_info(port).await?;
        let transport =
            BrowserTransport::connect(&info.web_socket_debugger_url, timeout).await?;

        let attached = transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target.id, "flatten": true }),
            )
            .await?;
        let session = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("attach returned no session id"))?
            .to_string();

        Ok(Self {
            transport,
            session,
            timeout,
        })
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.send("Page.navigate", json!({ "url": url })).await?;
        self.wait_for("['interactive','complete'].includes(document.readyState)")
            .await
            .context("page did not finish loading")
    }

    pub async fn click(&self, selector: &str) -> Result<()> {
        self.wait_visible(selector).await?;
        let sel = js_literal(selector)?;
        self.evaluate(&format!("document.querySelector({sel}).click()"))
            .await?;
        Ok(())
    }

    pub async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.wait_visible(selector).await?;
        let sel = js_literal(selector)?;
        self.evaluate(&format!(
            "(() => {{ const el = document.querySelector({sel}); el.focus(); el.value = ''; }})()"
        ))
        .await?;
        self.send("Input.insertText", json!({ "text": text })).await?;
        Ok(())
    }

    /// Evaluates JavaScript and returns the result serialized as JSON.
    pub async fn eval(&self, expression: &str) -> Result<String> {
        let value = self.evaluate(expression).await?;
        Ok(serde_json::to_string(&value)?)
    }

    /// Captures a PNG screenshot of the page.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let response = self.send("Page.captureScreenshot", json!({})).await?;
        let encoded = response
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("screenshot returned no data"))?;
        Ok(STANDARD.decode(encoded)?)
    }

    pub async fn title(&self) -> Result<String> {
        self.evaluate_string("document.title").await
    }

    pub async fn url(&self) -> Result<String> {
        self.evaluate_string("window.location.href").await
    }

    pub async fn text(&self, selector: &str) -> Result<String> {
        self.wait_ready(selector).await?;
        let sel = js_literal(selector)?;
        self.evaluate_string(&format!(
            "document.querySelector({sel}).textContent"
        ))
        .await
    }

    async fn wait_visible(&self, selector: &str) -> Result<()> {
        let sel = js_literal(selector)?;
        self.wait_for(&format!(
            "(() => {{ const el = document.querySelector({sel}); return !!el && el.offsetParent !== null; }})()"
        ))
        .await
        .with_context(|| format!("element not visible: {selector}"))
    }

    async fn wait_ready(&self, selector: &str) -> Result<()> {
        let sel = js_literal(selector)?;
        self.wait_for(&format!("!!document.querySelector({sel})"))
            .await
            .with_context(|| format!("element not found: {selector}"))
    }

    async fn wait_for(&self, condition: &str) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.evaluate(condition).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("timed out after {:?}", self.timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        let response = self
            .send(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;

        if let Some(description) = response
            .pointer("/exceptionDetails/exception/description")
            .and_then(Value::as_str)
        {
            bail!("javascript exception: {description}");
        }

        Ok(response.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    async fn evaluate_string(&self, expression: &str) -> Result<String> {
        Ok(self
            .evaluate(expression)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        Ok(self
            .transport
            .send_command(CommandTarget::Session(self.session.clone()), method, params)
            .await?)
    }
}

/// CSS selectors are embedded in evaluated scripts as JSON string
/// literals, which escapes quoting safely.
fn js_literal(selector: &str) -> Result<String> {
    Ok(serde_json::to_string(selector)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_escape_into_string_literals() {
        assert_eq!(js_literal("button#go").unwrap(), r#""button#go""#);
        assert_eq!(
            js_literal(r#"input[name="q"]"#).unwrap(),
            r#""input[name=\"q\"]""#
        );
    }
}
