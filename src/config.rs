//! Parsed runtime configuration (`singularity.conf`).
//!
//! Line oriented `key = value` pairs, `#` comments and `%include <glob>`
//! directives. A key may appear several times; `get` returns the last value,
//! `get_multi` all of them. Every recognised key carries a compile-time
//! default so lookups never come back empty-handed.

use crate::error::Error;
use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/singularity/singularity.conf";
pub const SYSCONFDIR: &str = "/etc";

pub const ALLOW_SETUID: &str = "allow setuid";
pub const ALLOW_PID_NS: &str = "allow pid ns";
pub const ALLOW_USER_NS: &str = "allow user ns";
pub const ALLOW_CONTAINER_DIR: &str = "allow container dir";
pub const ALLOW_CONTAINER_SQUASHFS: &str = "allow container squashfs";
pub const ALLOW_CONTAINER_EXTFS: &str = "allow container extfs";
pub const MOUNT_PROC: &str = "mount proc";
pub const MOUNT_SYS: &str = "mount sys";
pub const MOUNT_DEV: &str = "mount dev";
pub const MOUNT_HOME: &str = "mount home";
pub const MOUNT_TMP: &str = "mount tmp";
pub const MOUNT_SLAVE: &str = "mount slave";
pub const USER_BIND_CONTROL: &str = "user bind control";
pub const ENABLE_OVERLAY: &str = "enable overlay";
pub const BIND_PATH: &str = "bind path";
pub const CONTAINER_DIR: &str = "container dir";
pub const SESSIONDIR_PREFIX: &str = "sessiondir prefix";
pub const MAX_LOOP_DEVS: &str = "max loop devs";
pub const ROOT_DEFAULT_CAPABILITIES: &str = "root default capabilities";
pub const ALLOW_ROOT_CAPABILITIES: &str = "allow root capabilities";
pub const ALLOW_USER_CAPABILITIES: &str = "allow user capabilities";
pub const LIMIT_CONTAINER_PATHS: &str = "limit container paths";
pub const LIMIT_CONTAINER_OWNERS: &str = "limit container owners";
pub const CONFIG_RESOLV_CONF: &str = "config resolv_conf";
pub const CONFIG_PASSWD: &str = "config passwd";
pub const CONFIG_GROUP: &str = "config group";
pub const AUTOFS_BUG_PATH: &str = "autofs bug path";

/// Sentinel meaning "unset" for optional string keys.
const NULL_VALUE: &str = "NULL";

const MAX_INCLUDE_DEPTH: usize = 16;

static DEFAULTS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    HashMap::from([
        (ALLOW_SETUID, &["yes"][..]),
        (ALLOW_PID_NS, &["yes"][..]),
        (ALLOW_USER_NS, &["yes"][..]),
        (ALLOW_CONTAINER_DIR, &["yes"][..]),
        (ALLOW_CONTAINER_SQUASHFS, &["yes"][..]),
        (ALLOW_CONTAINER_EXTFS, &["yes"][..]),
        (MOUNT_PROC, &["yes"][..]),
        (MOUNT_SYS, &["yes"][..]),
        (MOUNT_DEV, &["yes"][..]),
        (MOUNT_HOME, &["yes"][..]),
        (MOUNT_TMP, &["yes"][..]),
        (MOUNT_SLAVE, &["yes"][..]),
        (USER_BIND_CONTROL, &["yes"][..]),
        (ENABLE_OVERLAY, &["yes"][..]),
        (BIND_PATH, &["/etc/localtime", "/etc/hosts"][..]),
        (CONTAINER_DIR, &["/var/singularity/mnt"][..]),
        (SESSIONDIR_PREFIX, &["/tmp/.singularity-session-"][..]),
        (MAX_LOOP_DEVS, &["128"][..]),
        (ROOT_DEFAULT_CAPABILITIES, &["full"][..]),
        (ALLOW_ROOT_CAPABILITIES, &["yes"][..]),
        (ALLOW_USER_CAPABILITIES, &["no"][..]),
        (LIMIT_CONTAINER_PATHS, &[NULL_VALUE][..]),
        (LIMIT_CONTAINER_OWNERS, &[NULL_VALUE][..]),
        (CONFIG_RESOLV_CONF, &["yes"][..]),
        (CONFIG_PASSWD, &["yes"][..]),
        (CONFIG_GROUP, &["yes"][..]),
        (AUTOFS_BUG_PATH, &[][..]),
    ])
});

#[derive(Debug, Default, Clone)]
pub struct Config {
    entries: HashMap<String, Vec<String>>,
}

impl Config {
    /// Loads `path` and everything it includes.
    ///
    /// A setuid invocation only ever reads [`DEFAULT_CONFIG_PATH`], and every
    /// file it reads must belong to root and must not be writable by group or
    /// other.
    pub fn load(path: &Path, setuid: bool) -> Result<Self> {
        if setuid && path != Path::new(DEFAULT_CONFIG_PATH) {
            bail!(Error::Usage(format!(
                "setuid invocations read only {DEFAULT_CONFIG_PATH}, not {}",
                path.display()
            )));
        }

        let mut config = Self::default();
        config.parse_file(path, setuid, 0)?;
        debug!(path = %path.display(), keys = config.entries.len(), "configuration loaded");
        Ok(config)
    }

    /// Parses configuration text that did not come from a file.
    #[cfg(test)]
    pub fn from_str_contents(contents: &str) -> Result<Self> {
        let mut config = Self::default();
        config.parse_contents(contents, None, false, 0)?;
        Ok(config)
    }

    fn parse_file(&mut self, path: &Path, require_root_owned: bool, depth: usize) -> Result<()> {
        if depth > MAX_INCLUDE_DEPTH {
            bail!(Error::Config(format!(
                "include nesting deeper than {MAX_INCLUDE_DEPTH} at {}",
                path.display()
            )));
        }

        if require_root_owned {
            check_root_owned(path)?;
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        self.parse_contents(&contents, Some(path), require_root_owned, depth)
    }

    fn parse_contents(
        &mut self,
        contents: &str,
        origin: Option<&Path>,
        require_root_owned: bool,
        depth: usize,
    ) -> Result<()> {
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(pattern) = line.strip_prefix("%include") {
                for include in resolve_include(pattern.trim(), origin)? {
                    self.parse_file(&include, require_root_owned, depth + 1)?;
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!(
                    file = %origin.map(|p| p.display().to_string()).unwrap_or_default(),
                    line = number + 1,
                    "ignoring malformed configuration line"
                );
                continue;
            };

            let key = key.trim();
            let value = value.trim();

            if !DEFAULTS.contains_key(key) {
                debug!(key, "unrecognised configuration key");
            }

            self.entries
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
        }

        Ok(())
    }

    /// Adds a value as if it had been read from the file.
    #[cfg(test)]
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .entry(key.to_string())
            .or_default()
            .push(value.into());
    }

    /// Last configured value of `key`, falling back to its default.
    pub fn get(&self, key: &str) -> Result<&str> {
        if let Some(value) = self.entries.get(key).and_then(|values| values.last()) {
            return Ok(value.as_str());
        }

        DEFAULTS
            .get(key)
            .and_then(|defaults| defaults.last())
            .copied()
            .ok_or_else(|| {
                Error::Config(format!("no value and no default for key '{key}'")).into()
            })
    }

    /// All configured values of `key`, or its defaults if it never appears.
    pub fn get_multi(&self, key: &str) -> Vec<&str> {
        match self.entries.get(key) {
            Some(values) => values.iter().map(String::as_str).collect(),
            None => DEFAULTS
                .get(key)
                .map(|defaults| defaults.to_vec())
                .unwrap_or_default(),
        }
    }

    /// Value of an optional key; `NULL` and empty mean unset.
    pub fn get_optional(&self, key: &str) -> Result<Option<&str>> {
        let value = self.get(key)?;
        if value.is_empty() || value == NULL_VALUE {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let value = self.get(key)?;
        parse_bool(value)
            .ok_or_else(|| Error::Config(format!("'{value}' is not a boolean for '{key}'")).into())
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.get(key)?;
        value
            .parse::<T>()
            .map_err(|err| Error::Config(format!("invalid value '{value}' for '{key}': {err}")).into())
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "y" | "1" => Some(true),
        "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn resolve_include(pattern: &str, origin: Option<&Path>) -> Result<Vec<PathBuf>> {
    if pattern.is_empty() {
        bail!(Error::Config("%include without a path".into()));
    }

    let pattern = match origin.and_then(Path::parent) {
        Some(dir) if !Path::new(pattern).is_absolute() => dir.join(pattern),
        _ => PathBuf::from(pattern),
    };
    let pattern = pattern.to_string_lossy();

    let mut matches = glob::glob(&pattern)
        .map_err(|err| Error::Config(format!("invalid %include pattern '{pattern}': {err}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to expand %include {pattern}"))?;

    if matches.is_empty() {
        bail!(Error::Config(format!("%include {pattern} matched nothing")));
    }

    matches.sort();
    Ok(matches)
}

fn check_root_owned(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to stat configuration file {}", path.display()))?;

    if metadata.uid() != 0 {
        bail!(Error::Config(format!(
            "{} must be owned by root",
            path.display()
        )));
    }

    if metadata.mode() & 0o022 != 0 {
        bail!(Error::Config(format!(
            "{} must not be writable by group or other",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_apply_when_unset() -> Result<()> {
        let config = Config::from_str_contents("")?;
        assert_eq!(config.get(CONTAINER_DIR)?, "/var/singularity/mnt");
        assert_eq!(config.get_parsed::<u32>(MAX_LOOP_DEVS)?, 128);
        assert_eq!(config.get_multi(BIND_PATH), ["/etc/localtime", "/etc/hosts"]);
        assert_eq!(config.get_optional(LIMIT_CONTAINER_PATHS)?, None);
        assert!(config.get("no such key").is_err());
        Ok(())
    }

    #[test]
    fn test_values_comments_and_multi_keys() -> Result<()> {
        let config = Config::from_str_contents(
            "# comment\n\
             allow container squashfs = no\n\
             bind path = /scratch\n\
             \n\
             bind path = /opt:/mnt/opt\n\
             garbage line\n\
             max loop devs = 64\n",
        )?;

        assert!(!config.get_bool(ALLOW_CONTAINER_SQUASHFS)?);
        assert_eq!(config.get_multi(BIND_PATH), ["/scratch", "/opt:/mnt/opt"]);
        assert_eq!(config.get(BIND_PATH)?, "/opt:/mnt/opt");
        assert_eq!(config.get_parsed::<u32>(MAX_LOOP_DEVS)?, 64);
        Ok(())
    }

    #[test]
    fn test_boolean_spellings() -> Result<()> {
        let spellings = [
            ("yes", true),
            ("Y", true),
            ("1", true),
            ("no", false),
            ("n", false),
            ("0", false),
        ];

        for (raw, expected) in spellings {
            let config = Config::from_str_contents(&format!("mount proc = {raw}"))?;
            assert_eq!(config.get_bool(MOUNT_PROC)?, expected, "{raw}");
        }

        let config = Config::from_str_contents("mount proc = maybe")?;
        assert!(config.get_bool(MOUNT_PROC).is_err());
        Ok(())
    }

    #[test]
    fn test_include_expands_glob_relative_to_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conf_d = dir.path().join("conf.d");
        fs::create_dir(&conf_d)?;

        fs::write(conf_d.join("10-a.conf"), "bind path = /a\n")?;
        fs::write(conf_d.join("20-b.conf"), "bind path = /b\nmount dev = minimal\n")?;

        let main = dir.path().join("main.conf");
        let mut file = fs::File::create(&main)?;
        writeln!(file, "mount dev = no")?;
        writeln!(file, "%include conf.d/*.conf")?;

        let config = Config::load(&main, false)?;
        assert_eq!(config.get_multi(BIND_PATH), ["/a", "/b"]);
        assert_eq!(config.get(MOUNT_DEV)?, "minimal");
        Ok(())
    }

    #[test]
    fn test_include_without_match_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let main = dir.path().join("main.conf");
        fs::write(&main, "%include missing/*.conf\n")?;

        let error = Config::load(&main, false).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Config(_))));
        Ok(())
    }

    #[test]
    fn test_setuid_refuses_other_config_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let main = dir.path().join("main.conf");
        fs::write(&main, "allow setuid = yes\n")?;

        let error = Config::load(&main, true).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Usage(_))));
        Ok(())
    }

    #[test]
    fn test_self_include_is_bounded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let main = dir.path().join("loop.conf");
        fs::write(&main, "%include loop.conf\n")?;

        assert!(Config::load(&main, false).is_err());
        Ok(())
    }
}
