//! Privacy filtering applied in-line with log writes.
//!
//! Two denylists drive the filter: response header names (exact,
//! case-insensitive) and JSON body field names (substring,
//! case-insensitive). Matched values are replaced with a fixed
//! placeholder; everything else passes through untouched. A disabled
//! redactor is the identity on both operations.

mod patterns;

pub use patterns::{DEFAULT_BODY_FIELD_DENYLIST, DEFAULT_HEADER_DENYLIST};

use serde_json::{Map, Value};

use patterns::{body_field_matches, header_matches};

/// Placeholder written in place of redacted content.
pub const REDACTED: &str = "[REDACTED]";

/// Header and body-field filter shared by all tab monitors.
pub struct Redactor {
    enabled: bool,
    header_denylist: Vec<String>,
    body_field_denylist: Vec<String>,
}

impl Redactor {
    /// Redactor with the default denylists.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            header_denylist: DEFAULT_HEADER_DENYLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            body_field_denylist: DEFAULT_BODY_FIELD_DENYLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Redactor with user entries appended to the default denylists.
    pub fn with_custom_rules(enabled: bool, headers: &[String], body_fields: &[String]) -> Self {
        let mut redactor = Self::new(enabled);
        redactor.header_denylist.extend(headers.iter().cloned());
        redactor
            .body_field_denylist
            .extend(body_fields.iter().cloned());
        redactor
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns a copy of `headers` with denylisted values replaced by
    /// [`REDACTED`].
    pub fn redact_headers(&self, headers: Map<String, Value>) -> Map<String, Value> {
        if !self.enabled {
            return headers;
        }

        headers
            .into_iter()
            .map(|(key, value)| {
                if self.should_redact_header(&key) {
                    (key, Value::String(REDACTED.to_string()))
                } else {
                    (key, value)
                }
            })
            .collect()
    }

    /// Parses `body` as JSON and redacts denylisted fields recursively.
    /// Non-JSON bodies are returned unchanged; there is no heuristic
    /// scrubbing of opaque text.
    pub fn redact_body(&self, body: &str) -> String {
        if !self.enabled || body.is_empty() {
            return body.to_string();
        }

        let Ok(parsed) = serde_json::from_str::<Value>(body) else {
            return body.to_string();
        };

        let redacted = self.redact_value(parsed);
        serde_json::to_string(&redacted).unwrap_or_else(|_| body.to_string())
    }

    fn should_redact_header(&self, name: &str) -> bool {
        self.header_denylist
            .iter()
            .any(|pattern| header_matches(name, pattern))
    }

    fn should_redact_body_field(&self, name: &str) -> bool {
        self.body_field_denylist
            .iter()
            .any(|pattern| body_field_matches(name, pattern))
    }

    fn redact_value(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, val)| {
                        if self.should_redact_body_field(&key) {
                            (key, Value::String(REDACTED.to_string()))
                        } else {
                            (key, self.redact_value(val))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.redact_value(v)).collect())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn redacts_denylisted_headers() {
        let redactor = Redactor::new(true);
        let out = redactor.redact_headers(headers(&[
            ("Set-Cookie", "s=abc"),
            ("Content-Type", "text/plain"),
        ]));

        assert_eq!(out["Set-Cookie"], REDACTED);
        assert_eq!(out["Content-Type"], "text/plain");
    }

    #[test]
    fn redacts_nested_body_fields() {
        let redactor = Redactor::new(true);
        let body = r#"{"user":{"password":"p","name":"a"},"items":[{"api_key":"k"}],"ok":true}"#;
        let out: Value = serde_json::from_str(&redactor.redact_body(body)).unwrap();

        assert_eq!(out["user"]["password"], REDACTED);
        assert_eq!(out["user"]["name"], "a");
        assert_eq!(out["items"][0]["api_key"], REDACTED);
        assert_eq!(out["ok"], true);
    }

    #[test]
    fn non_json_body_passes_through() {
        let redactor = Redactor::new(true);
        let body = "password=hunter2&user=a";
        assert_eq!(redactor.redact_body(body), body);
    }

    #[test]
    fn redaction_is_idempotent() {
        let redactor = Redactor::new(true);
        let body = json!({"password": "p", "ok": true}).to_string();
        let once = redactor.redact_body(&body);
        let twice = redactor.redact_body(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn disabled_redactor_is_identity() {
        let redactor = Redactor::new(false);
        let hdrs = headers(&[("Cookie", "s=abc")]);
        assert_eq!(redactor.redact_headers(hdrs.clone()), hdrs);

        let body = r#"{"password":"p"}"#;
        assert_eq!(redactor.redact_body(body), body);
    }

    #[test]
    fn custom_rules_extend_defaults() {
        let redactor = Redactor::with_custom_rules(
            true,
            &["x-internal-trace".to_string()],
            &["session_key".to_string()],
        );

        let out = redactor.redact_headers(headers(&[("X-Internal-Trace", "t"), ("Cookie", "c")]));
        assert_eq!(out["X-Internal-Trace"], REDACTED);
        assert_eq!(out["Cookie"], REDACTED);

        let body: Value =
            serde_json::from_str(&redactor.redact_body(r#"{"session_key":"s"}"#)).unwrap();
        assert_eq!(body["session_key"], REDACTED);
    }
}
