//! Shared variable namespace that survives across step executions.

use serde_json::{Map, Value};

use crate::core::types::ExecMode;
use crate::error::KernelError;

/// Keys with this prefix belong to the kernel and cannot be written by steps.
pub const RESERVED_PREFIX: &str = "__";

pub fn is_reserved(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// Insertion-ordered key/value store shared by every step of a session.
///
/// Iteration order is only meaningful for display. Execution never depends on
/// it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedCache {
    values: Map<String, Value>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `entries` into the cache.
    ///
    /// Fails without mutating anything if any key is reserved.
    pub fn put<I, K>(&mut self, entries: I) -> Result<(), KernelError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entries: Vec<(String, Value)> =
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        if let Some((key, _)) = entries.iter().find(|(key, _)| is_reserved(key)) {
            return Err(KernelError::ProtectedKey(key.clone()));
        }
        for (key, value) in entries {
            self.values.insert(key, value);
        }
        Ok(())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<(), KernelError> {
        self.put([(key.into(), value)])
    }

    /// Kernel-side write that may target reserved keys.
    pub fn put_internal(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Value for `key`, or `default` when absent. Never fails.
    pub fn fetch(&self, key: &str, default: Value) -> Value {
        self.values.get(key).cloned().unwrap_or(default)
    }

    /// Remove every non-reserved key.
    pub fn clear(&mut self) {
        self.values.retain(|key, _| is_reserved(key));
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// User-visible values, reserved keys excluded.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values
            .iter()
            .filter(|(key, _)| !is_reserved(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Namespace handed to a step: user values plus mode flags.
    pub fn namespace(&self, mode: ExecMode) -> Map<String, Value> {
        let mut namespace = self.snapshot();
        namespace.insert("is_testing".to_string(), Value::Bool(mode.is_testing));
        namespace.insert(
            "is_interactive".to_string(),
            Value::Bool(mode.is_interactive),
        );
        namespace.insert(
            "is_single_run".to_string(),
            Value::Bool(mode.is_single_run),
        );
        namespace
    }

    /// Apply values exported by a step.
    pub fn merge_exports(&mut self, exports: Map<String, Value>) -> Result<(), KernelError> {
        self.put(exports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fetch_returns_default_for_missing_key() {
        let cache = SharedCache::new();
        assert_eq!(cache.fetch("missing", json!(42)), json!(42));
    }

    #[test]
    fn put_overwrites_silently() {
        let mut cache = SharedCache::new();
        cache.set("x", json!(1)).expect("set");
        cache.put([("x", json!(2)), ("y", json!("b"))]).expect("put");
        assert_eq!(cache.get("x"), Some(&json!(2)));
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["x", "y"]);
    }

    /// Verifies a reserved key anywhere in the batch rejects the whole put.
    #[test]
    fn reserved_key_write_fails_without_mutation() {
        let mut cache = SharedCache::new();
        let err = cache
            .put([("ok", json!(1)), ("__run_uid", json!("x"))])
            .unwrap_err();
        assert_eq!(err, KernelError::ProtectedKey("__run_uid".to_string()));
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_keeps_reserved_keys() {
        let mut cache = SharedCache::new();
        cache.put_internal("__step_name", json!("S01.py"));
        cache.set("df", json!([1, 2])).expect("set");
        cache.clear();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("__step_name").is_some());
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn namespace_injects_mode_flags() {
        let mut cache = SharedCache::new();
        cache.set("a", json!(1)).expect("set");
        cache.put_internal("__hidden", json!(true));
        let ns = cache.namespace(ExecMode {
            is_testing: true,
            is_interactive: false,
            is_single_run: true,
        });
        assert_eq!(ns.get("a"), Some(&json!(1)));
        assert_eq!(ns.get("is_testing"), Some(&json!(true)));
        assert_eq!(ns.get("is_single_run"), Some(&json!(true)));
        assert!(!ns.contains_key("__hidden"));
    }
}
