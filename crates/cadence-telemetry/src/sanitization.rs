//! Log sanitization and privacy protection

use crate::{config::PrivacyConfig, Error, Result};
use regex::Regex;
use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

/// Redacts credentials from text and JSON before it reaches a log line or
/// an error message.
#[derive(Debug, Clone)]
pub struct DataSanitizer {
    enabled: bool,
    patterns: Vec<Regex>,
    redacted_fields: Vec<String>,
}

impl DataSanitizer {
    /// Create a new data sanitizer
    pub fn new(config: &PrivacyConfig) -> Result<Self> {
        let mut patterns = Vec::new();

        for pattern_str in &config.redaction_patterns {
            let regex = Regex::new(pattern_str).map_err(|e| Error::Config {
                message: format!("Invalid redaction pattern '{}': {}", pattern_str, e),
            })?;
            patterns.push(regex);
        }

        Ok(Self {
            enabled: config.sanitize_enabled,
            patterns,
            redacted_fields: config
                .redacted_fields
                .iter()
                .map(|f| f.to_lowercase())
                .collect(),
        })
    }

    /// Sanitizer built from the default privacy settings.
    pub fn with_defaults() -> Self {
        let config = PrivacyConfig::default();
        Self {
            enabled: true,
            patterns: config
                .redaction_patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            redacted_fields: config.redacted_fields,
        }
    }

    /// Sanitize a text string
    pub fn sanitize_text(&self, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }

        let mut sanitized = text.to_string();
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, |caps: &regex::Captures| match caps.get(1) {
                    Some(field) => format!("{}={}", field.as_str(), REDACTED),
                    None => REDACTED.to_string(),
                })
                .into_owned();
        }

        sanitized
    }

    /// Sanitize a JSON value, redacting sensitive keys wholesale
    pub fn sanitize_json(&self, mut json: Value) -> Value {
        if self.enabled {
            self.sanitize_json_recursive(&mut json);
        }
        json
    }

    /// Check if a field name should be redacted
    pub fn should_redact_field(&self, field_name: &str) -> bool {
        let field_lower = field_name.to_lowercase();
        self.redacted_fields
            .iter()
            .any(|redacted| field_lower.contains(redacted.as_str()))
    }

    fn sanitize_json_recursive(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    if self.should_redact_field(key) {
                        *val = Value::String(REDACTED.to_string());
                    } else {
                        self.sanitize_json_recursive(val);
                    }
                }
            }
            Value::Array(arr) => {
                for item in arr.iter_mut() {
                    self.sanitize_json_recursive(item);
                }
            }
            Value::String(s) => {
                *s = self.sanitize_text(s);
            }
            _ => {}
        }
    }
}

impl Default for DataSanitizer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_sanitization() {
        let sanitizer = DataSanitizer::default();

        let original = "login failed: token=abc.def-123 password=hunter2 user=ada";
        let sanitized = sanitizer.sanitize_text(original);

        assert!(sanitized.contains("token=[REDACTED]"));
        assert!(!sanitized.contains("abc.def-123"));
        assert!(!sanitized.contains("hunter2"));
        assert!(sanitized.contains("user=ada"));
    }

    #[test]
    fn test_headers_are_redacted() {
        let sanitizer = DataSanitizer::default();

        let sanitized = sanitizer.sanitize_text(
            "Cookie: sid=s3cr3t; theme=dark\nAuthorization: Bearer eyJhbGci.payload\nAccept: */*",
        );

        assert!(!sanitized.contains("s3cr3t"));
        assert!(!sanitized.contains("eyJhbGci"));
        assert!(sanitized.contains("Accept: */*"));
    }

    #[test]
    fn test_words_containing_sid_are_untouched() {
        let sanitizer = DataSanitizer::default();
        assert_eq!(sanitizer.sanitize_text("insid=3"), "insid=3");
    }

    #[test]
    fn test_json_sanitization() {
        let sanitizer = DataSanitizer::default();

        let json = sanitizer.sanitize_json(serde_json::json!({
            "username": "testuser",
            "password": "secret123",
            "session_blob": {"cookies": [{"name": "sid", "value": "v"}]},
            "data": {
                "access_token": "abc",
                "note": "token=leaked"
            }
        }));

        assert_eq!(json["username"], "testuser");
        assert_eq!(json["password"], "[REDACTED]");
        assert_eq!(json["session_blob"], "[REDACTED]");
        assert_eq!(json["data"]["access_token"], "[REDACTED]");
        assert_eq!(json["data"]["note"], "token=[REDACTED]");
    }

    #[test]
    fn test_disabled_sanitizer_passes_through() {
        let config = PrivacyConfig {
            sanitize_enabled: false,
            ..Default::default()
        };
        let sanitizer = DataSanitizer::new(&config).unwrap();
        assert_eq!(sanitizer.sanitize_text("password=x"), "password=x");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = PrivacyConfig {
            redaction_patterns: vec!["(unclosed".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            DataSanitizer::new(&config),
            Err(Error::Config { .. })
        ));
    }
}
