//! Process-wide key/value store of runtime tunables.
//!
//! Seeded from `SINGULARITY_*` environment variables; the prefix is stripped
//! and keys are upper-cased, so `SINGULARITY_bindpath` and `BINDPATH` address
//! the same entry.

use crate::error::Error;
use anyhow::{Result, bail};
use std::{collections::HashMap, str::FromStr};
use tracing::{debug, warn};

pub const ENV_PREFIX: &str = "SINGULARITY_";

/// Upper bound on distinct keys.
pub const MAX_REGISTRY_KEYS: usize = 128;

/// Upper bound on values chained under one key.
pub const MAX_CONFIG_ENTRIES: usize = 64;

#[derive(Debug, Default, Clone)]
pub struct Registry {
    entries: HashMap<String, Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from the current process environment.
    pub fn from_env() -> Result<Self> {
        let mut vars = Vec::new();

        for (key, value) in std::env::vars_os() {
            match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => vars.push((key, value)),
                (Ok(key), Err(_)) if key.starts_with(ENV_PREFIX) => {
                    warn!(%key, "ignoring environment variable with non UTF-8 value");
                }
                _ => {}
            }
        }

        Self::from_vars(vars)
    }

    /// Builds a registry from `(name, value)` pairs, keeping only prefixed names.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut registry = Self::new();

        for (name, value) in vars {
            let Some(key) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };

            if key.is_empty() {
                continue;
            }

            let value = value.into();
            debug!(key, value = %value, "registry seed");
            registry.set(key, value)?;
        }

        Ok(registry)
    }

    /// Appends `value` to the chain stored under `key`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        let key = normalize(key);

        if !self.entries.contains_key(&key) && self.entries.len() >= MAX_REGISTRY_KEYS {
            bail!(Error::Resource(format!(
                "registry is full ({MAX_REGISTRY_KEYS} keys), cannot add {key}"
            )));
        }

        let chain = self.entries.entry(key).or_default();
        if chain.len() >= MAX_CONFIG_ENTRIES {
            bail!(Error::Resource(format!(
                "too many values for registry key ({MAX_CONFIG_ENTRIES} max)"
            )));
        }

        chain.push(value.into());
        Ok(())
    }

    /// Returns the most recently set value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&normalize(key))
            .and_then(|chain| chain.last())
            .map(String::as_str)
    }

    /// Returns every value set for `key`, oldest first.
    pub fn get_multi(&self, key: &str) -> &[String] {
        self.entries
            .get(&normalize(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Presence test used for flag-style keys (`CONTAIN`, `WRITABLE`, ...).
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Parses the last value of `key`; absent keys yield `Ok(None)`.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|err| {
                Error::Usage(format!("invalid value '{raw}' for {ENV_PREFIX}{key}: {err}")).into()
            }),
        }
    }

    /// Comma separated list stored under `key`, empty items dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_multi(key)
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn normalize(key: &str) -> String {
    key.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_strips_prefix_and_ignores_others() -> Result<()> {
        let registry = Registry::from_vars([
            ("SINGULARITY_IMAGE", "/tmp/demo.img"),
            ("SINGULARITY_", "empty"),
            ("HOME", "/root"),
            ("SINGULARITY_bindpath", "/data"),
        ])?;

        assert_eq!(registry.get("IMAGE"), Some("/tmp/demo.img"));
        assert_eq!(registry.get("bindpath"), Some("/data"));
        assert_eq!(registry.get("HOME"), None);
        assert_eq!(registry.len(), 2);
        Ok(())
    }

    #[test]
    fn test_last_value_wins_and_chain_keeps_order() -> Result<()> {
        let mut registry = Registry::new();
        registry.set("bindpath", "/a")?;
        registry.set("BINDPATH", "/b,/c")?;

        assert_eq!(registry.get("BindPath"), Some("/b,/c"));
        assert_eq!(registry.get_multi("BINDPATH"), ["/a", "/b,/c"]);
        assert_eq!(registry.get_list("BINDPATH"), ["/a", "/b", "/c"]);
        Ok(())
    }

    #[test]
    fn test_chain_is_bounded() -> Result<()> {
        let mut registry = Registry::new();
        for i in 0..MAX_CONFIG_ENTRIES {
            registry.set("K", i.to_string())?;
        }
        assert!(registry.set("K", "overflow").is_err());
        Ok(())
    }

    #[test]
    fn test_key_count_is_bounded() -> Result<()> {
        let mut registry = Registry::new();
        for i in 0..MAX_REGISTRY_KEYS {
            registry.set(&format!("KEY{i}"), "v")?;
        }
        assert!(registry.set("ONE_MORE", "v").is_err());
        registry.set("KEY0", "still fine")?;
        Ok(())
    }

    #[test]
    fn test_get_parsed_reports_bad_values() -> Result<()> {
        let mut registry = Registry::new();
        registry.set("TARGET_UID", "1000")?;
        registry.set("TARGET_GID", "abc")?;

        assert_eq!(registry.get_parsed::<u32>("TARGET_UID")?, Some(1000));
        assert!(registry.get_parsed::<u32>("TARGET_GID").is_err());
        assert_eq!(registry.get_parsed::<u32>("MISSING")?, None);
        Ok(())
    }
}
