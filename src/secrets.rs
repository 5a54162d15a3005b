//! Secret registry and log redaction.
//!
//! Credentials from the inventory are registered here at load time, and every
//! assembled log payload passes through [`SecretStore::redact`] immediately
//! before emission. The set is append-only for the life of the process.

use std::collections::BTreeSet;
use std::sync::RwLock;

use serde_json::Value;

/// Replacement text for a redacted occurrence.
pub const REDACTED: &str = "REDACTED_SECRET";

/// Process-wide set of sensitive strings.
#[derive(Debug, Default)]
pub struct SecretStore {
    secrets: RwLock<BTreeSet<String>>,
}

impl SecretStore {
    pub fn new() -> Self {
        SecretStore::default()
    }

    /// Register a sensitive string. Empty strings are ignored; redacting the
    /// empty string would mangle every value.
    pub fn add(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.is_empty() {
            return;
        }
        self.secrets
            .write()
            .expect("secret set lock poisoned")
            .insert(secret);
    }

    pub fn is_empty(&self) -> bool {
        self.secrets
            .read()
            .expect("secret set lock poisoned")
            .is_empty()
    }

    /// Replace every registered secret occurring in `input`.
    pub fn redact_str(&self, input: &str) -> String {
        let secrets = self.secrets.read().expect("secret set lock poisoned");
        let mut output = input.to_string();
        for secret in secrets.iter() {
            if output.contains(secret.as_str()) {
                output = output.replace(secret.as_str(), REDACTED);
            }
        }
        output
    }

    /// Recursively redact a JSON payload, returning the same shape.
    ///
    /// Strings have occurrences replaced. Object keys are redacted like
    /// values. Numbers whose decimal rendering contains a secret have the
    /// secret elided; if the remainder no longer parses as a number the whole
    /// value collapses to the placeholder string rather than risk leakage.
    pub fn redact(&self, input: Value) -> Value {
        if self.is_empty() {
            return input;
        }
        self.redact_value(input)
    }

    fn redact_value(&self, input: Value) -> Value {
        match input {
            Value::Null | Value::Bool(_) => input,
            Value::String(s) => Value::String(self.redact_str(&s)),
            Value::Number(n) => self.redact_number(n),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => {
                let mut output = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    output.insert(self.redact_str(&key), self.redact_value(value));
                }
                Value::Object(output)
            }
        }
    }

    fn redact_number(&self, n: serde_json::Number) -> Value {
        let rendered = n.to_string();
        let secrets = self.secrets.read().expect("secret set lock poisoned");

        if !secrets.iter().any(|s| rendered.contains(s.as_str())) {
            return Value::Number(n);
        }

        let mut elided = rendered;
        for secret in secrets.iter() {
            elided = elided.replace(secret.as_str(), "");
        }
        drop(secrets);

        if let Ok(i) = elided.parse::<i64>() {
            return Value::from(i);
        }
        if let Ok(f) = elided.parse::<f64>() {
            return Value::from(f);
        }
        Value::String(REDACTED.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_store_is_identity() {
        let store = SecretStore::new();
        let payload = json!({"password": "hunter2", "nested": ["hunter2"]});
        assert_eq!(store.redact(payload.clone()), payload);
    }

    #[test]
    fn string_occurrences_replaced() {
        let store = SecretStore::new();
        store.add("hunter2");
        assert_eq!(
            store.redact_str("--password hunter2 --other"),
            format!("--password {REDACTED} --other")
        );
    }

    #[test]
    fn nested_values_and_keys_redacted() {
        let store = SecretStore::new();
        store.add("s3cr3t");
        let payload = json!({
            "args": ["svn", "info", "--password", "s3cr3t"],
            "s3cr3t-key": {"inner": "prefix s3cr3t suffix"},
        });
        let redacted = store.redact(payload);
        let rendered = redacted.to_string();
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains(REDACTED));
        // Shape is preserved: still an object with an array inside.
        assert!(redacted.get(format!("{REDACTED}-key")).is_some());
        assert_eq!(redacted["args"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn numbers_have_secret_digits_elided() {
        let store = SecretStore::new();
        store.add("1234");
        assert_eq!(store.redact(json!(90123456)), json!(9056));
    }

    #[test]
    fn number_collapsing_to_nothing_becomes_placeholder() {
        let store = SecretStore::new();
        store.add("42");
        assert_eq!(store.redact(json!(42)), json!(REDACTED));
    }

    #[test]
    fn zero_and_booleans_survive() {
        let store = SecretStore::new();
        store.add("topsecret");
        let payload = json!({"count": 0, "ok": false});
        assert_eq!(store.redact(payload.clone()), payload);
    }

    #[test]
    fn multiple_secrets_all_replaced() {
        let store = SecretStore::new();
        store.add("alpha");
        store.add("beta");
        let out = store.redact_str("alpha and beta and alpha");
        assert!(!out.contains("alpha"));
        assert!(!out.contains("beta"));
    }

    #[test]
    fn empty_secret_ignored() {
        let store = SecretStore::new();
        store.add("");
        assert!(store.is_empty());
        assert_eq!(store.redact_str("unchanged"), "unchanged");
    }
}
