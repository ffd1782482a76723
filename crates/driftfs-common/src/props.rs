//! Configuration property map
//!
//! Components are configured through a flat map of dotted string keys.
//! The map is built programmatically by the host process; parsing of
//! configuration files happens outside this crate.

use std::collections::HashMap;
use std::fmt;

/// Flat configuration map with typed accessors.
///
/// Lookups never fail: each getter takes the value to return when the key
/// is absent or does not parse, mirroring how components layer runtime
/// reconfiguration over their current settings.
#[derive(Clone, Debug, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.values.get(key).map(String::as_str).unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(v) => v.trim().parse().unwrap_or(default),
            None => default,
        }
    }

    pub fn get_i32(&self, key: &str, default: i32) -> i32 {
        match self.values.get(key) {
            Some(v) => v.trim().parse().unwrap_or(default),
            None => default,
        }
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        match self.values.get(key) {
            Some(v) => v.trim().parse().unwrap_or(default),
            None => default,
        }
    }

    /// Booleans follow the original convention: any value parsing to a
    /// nonzero integer is true, `0` is false.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(v) => v.trim().parse::<i64>().map(|n| n != 0).unwrap_or(default),
            None => default,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        for key in keys {
            writeln!(f, "{} = {}", key, self.values[key])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let mut props = Properties::new();
        props
            .set("chunkServer.meta.inactivityTimeout", "30")
            .set("chunkServer.meta.noFids", "0")
            .set("metaServer.dataStore.maxReadSize", "1048576")
            .set("chunkServer.meta.auth.authType", "Krb5 PSK");

        assert_eq!(props.get_i32("chunkServer.meta.inactivityTimeout", 65), 30);
        assert!(!props.get_bool("chunkServer.meta.noFids", true));
        assert_eq!(
            props.get_usize("metaServer.dataStore.maxReadSize", 2 << 20),
            1 << 20
        );
        assert_eq!(
            props.get_str("chunkServer.meta.auth.authType", "Krb5 X509 PSK"),
            "Krb5 PSK"
        );
    }

    #[test]
    fn test_missing_and_malformed_fall_back_to_default() {
        let mut props = Properties::new();
        props.set("threadCount", "not a number");

        assert_eq!(props.get_i32("threadCount", 4), 4);
        assert_eq!(props.get_i64("absent", -1), -1);
        assert!(props.get_bool("absent", true));
    }
}
