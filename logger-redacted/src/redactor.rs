use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

lazy_static! {
    static ref EMAIL_REGEX: Option<Regex> =
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").ok();
    static ref BEARER_REGEX: Option<Regex> =
        Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]+=*").ok();
}

const MASK: &str = "[REDACTED]";

/// What the argument redactor masks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Object keys whose values are always masked (case-insensitive substring match)
    pub sensitive_keys: Vec<String>,
    pub mask_emails: bool,
    pub mask_bearer_tokens: bool,
    /// Replace masked values with a short digest so equal values can be correlated
    pub hash_for_correlation: bool,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            sensitive_keys: ["password", "secret", "token", "api_key", "authorization", "credential"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            mask_emails: true,
            mask_bearer_tokens: true,
            hash_for_correlation: false,
        }
    }
}

/// Masks sensitive content in structured arguments before they reach a log line.
#[derive(Debug, Clone)]
pub struct ArgumentRedactor {
    config: RedactionConfig,
    sensitive_keys: Vec<String>,
}

impl Default for ArgumentRedactor {
    fn default() -> Self {
        Self::new(RedactionConfig::default())
    }
}

impl ArgumentRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        let sensitive_keys = config
            .sensitive_keys
            .iter()
            .map(|key| key.to_ascii_lowercase())
            .collect();
        Self { config, sensitive_keys }
    }

    pub fn config(&self) -> &RedactionConfig {
        &self.config
    }

    /// Return a copy of `value` with sensitive keys and patterns masked
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, inner) in map {
                    let redacted = if self.is_sensitive_key(key) {
                        Value::String(self.mask(&inner.to_string()))
                    } else {
                        self.redact(inner)
                    };
                    out.insert(key.clone(), redacted);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|item| self.redact(item)).collect()),
            Value::String(text) => Value::String(self.redact_text(text)),
            other => other.clone(),
        }
    }

    /// Mask e-mail addresses and bearer tokens inside free text
    pub fn redact_text(&self, text: &str) -> String {
        let mut result = text.to_string();
        if self.config.mask_bearer_tokens {
            if let Some(regex) = BEARER_REGEX.as_ref() {
                result = regex
                    .replace_all(&result, |caps: &regex::Captures| format!("Bearer {}", self.mask(&caps[0])))
                    .into_owned();
            }
        }
        if self.config.mask_emails {
            if let Some(regex) = EMAIL_REGEX.as_ref() {
                result = regex
                    .replace_all(&result, |caps: &regex::Captures| self.mask(&caps[0]))
                    .into_owned();
            }
        }
        result
    }

    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.sensitive_keys.iter().any(|sensitive| key.contains(sensitive.as_str()))
    }

    fn mask(&self, value: &str) -> String {
        if self.config.hash_for_correlation {
            format!("[REDACTED:{}]", hash_value(value))
        } else {
            MASK.to_string()
        }
    }
}

fn hash_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    // first 8 bytes keep the tag short
    general_purpose::STANDARD_NO_PAD.encode(digest.get(..8).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_keys_are_masked() {
        let redactor = ArgumentRedactor::default();
        let redacted = redactor.redact(&json!({
            "to": "ops",
            "smtp_password": "hunter2",
            "nested": { "API_KEY": 42, "count": 3 }
        }));

        assert_eq!(redacted["to"], "ops");
        assert_eq!(redacted["smtp_password"], "[REDACTED]");
        assert_eq!(redacted["nested"]["API_KEY"], "[REDACTED]");
        assert_eq!(redacted["nested"]["count"], 3);
    }

    #[test]
    fn test_email_and_bearer_redaction() {
        let redactor = ArgumentRedactor::default();
        let text = redactor.redact_text("notify john.doe@example.com with Bearer abc.def-123");
        assert!(!text.contains("john.doe@example.com"));
        assert!(!text.contains("abc.def-123"));
        assert!(text.starts_with("notify [REDACTED]"));
    }

    #[test]
    fn test_hash_for_correlation_is_stable() {
        let redactor = ArgumentRedactor::new(RedactionConfig {
            hash_for_correlation: true,
            ..Default::default()
        });
        let first = redactor.redact(&json!({ "token": "abc" }));
        let second = redactor.redact(&json!({ "token": "abc" }));
        let other = redactor.redact(&json!({ "token": "xyz" }));

        let tag = first["token"].as_str().unwrap();
        assert!(tag.starts_with("[REDACTED:"));
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn test_disabled_patterns_leave_text_alone() {
        let redactor = ArgumentRedactor::new(RedactionConfig {
            mask_emails: false,
            mask_bearer_tokens: false,
            ..Default::default()
        });
        assert_eq!(redactor.redact_text("a@b.io"), "a@b.io");
    }
}
