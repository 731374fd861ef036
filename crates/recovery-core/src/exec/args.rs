use std::collections::HashMap;
use std::time::Duration;

/// Action arguments given as `key:value` strings in the configuration.
///
/// Accessors fall back to the supplied default when a key is missing or its
/// value does not parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionArgs(HashMap<String, String>);

impl ActionArgs {
    pub fn parse(raw: &[String]) -> Self {
        let mut map = HashMap::new();
        for arg in raw {
            let arg = arg.trim();
            if arg.is_empty() {
                continue;
            }
            let (key, value) = arg.split_once(':').unwrap_or((arg, ""));
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self(map)
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_string(&self, key: &str, default: &str) -> String {
        match self.0.get(key) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => default.to_string(),
        }
    }

    pub fn as_bool(&self, key: &str, default: bool) -> bool {
        match self.0.get(key).map(|v| v.to_lowercase()) {
            Some(v) if v == "true" => true,
            Some(v) if v == "false" => false,
            _ => default,
        }
    }

    pub fn as_int(&self, key: &str, default: i64) -> i64 {
        self.0
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn as_duration_secs(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(
            self.0
                .get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default),
        )
    }

    /// Comma separated list; empty items are dropped.
    pub fn as_string_list(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
