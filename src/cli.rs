use crate::{config::DEFAULT_CONFIG_PATH, registry::Registry};
use anyhow::Result;
use clap::{Args, Parser};
use std::path::PathBuf;

const HEADING_GENERAL: &str = "General";
const HEADING_IMAGE: &str = "Image";
const HEADING_NAMESPACES: &str = "Namespaces";

#[derive(Parser, Debug)]
#[command(
    name = "sexec",
    version,
    about = "Launch a command inside a container image",
    long_about = "Every option mirrors a SINGULARITY_* environment variable; \
                  the environment is read first and options override it."
)]
pub struct Cli {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(flatten)]
    pub image: ImageOptions,

    #[command(flatten)]
    pub namespace: NamespaceOptions,

    /// Command (and arguments) to run inside the container
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct GeneralOptions {
    #[arg(
        long,
        value_name = "FILE",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Runtime configuration file",
        help_heading = HEADING_GENERAL
    )]
    pub config: PathBuf,

    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase log verbosity (repeatable)",
        help_heading = HEADING_GENERAL
    )]
    pub verbose: u8,

    #[arg(
        short,
        long,
        conflicts_with = "verbose",
        help = "Only log errors",
        help_heading = HEADING_GENERAL
    )]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct ImageOptions {
    #[arg(
        long,
        value_name = "PATH",
        help = "Container image file or directory (SINGULARITY_IMAGE)",
        help_heading = HEADING_IMAGE
    )]
    pub image: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "Mount the image read-write",
        help_heading = HEADING_IMAGE
    )]
    pub writable: bool,

    #[arg(
        long,
        help = "Check the image hash against its signed verification block",
        help_heading = HEADING_IMAGE
    )]
    pub verify: bool,

    #[arg(
        short,
        long,
        help = "Contain home and temporary directories",
        help_heading = HEADING_IMAGE
    )]
    pub contain: bool,
}

#[derive(Args, Debug)]
pub struct NamespaceOptions {
    #[arg(
        short,
        long,
        help = "Run in a new PID namespace",
        help_heading = HEADING_NAMESPACES
    )]
    pub pid: bool,

    #[arg(
        short,
        long,
        help = "Run in a new IPC namespace",
        help_heading = HEADING_NAMESPACES
    )]
    pub ipc: bool,

    #[arg(
        short,
        long,
        help = "Run in a new network namespace",
        help_heading = HEADING_NAMESPACES
    )]
    pub net: bool,

    #[arg(
        short,
        long,
        help = "Use an unprivileged user namespace instead of setuid",
        help_heading = HEADING_NAMESPACES
    )]
    pub userns: bool,
}

impl Cli {
    /// Registry keys fed by boolean switches.
    fn mappings(&self) -> [(bool, &'static str); 7] {
        [
            (self.image.writable, "WRITABLE"),
            (self.image.verify, "VERIFY"),
            (self.image.contain, "CONTAIN"),
            (self.namespace.pid, "UNSHARE_PID"),
            (self.namespace.ipc, "UNSHARE_IPC"),
            (self.namespace.net, "UNSHARE_NET"),
            (self.namespace.userns, "NOSUID"),
        ]
    }

    /// Writes the options into the registry, overriding the environment.
    pub fn apply(&self, registry: &mut Registry) -> Result<()> {
        if let Some(image) = &self.image.image {
            registry.set("IMAGE", image.to_string_lossy())?;
        }

        for (enabled, key) in self.mappings() {
            if enabled {
                registry.set(key, "1")?;
            }
        }

        Ok(())
    }

    /// Filter directive for the tracing subscriber.
    pub fn log_level(&self) -> &'static str {
        match (self.general.quiet, self.general.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            (false, 2) => "debug",
            (false, _) => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_feed_registry() -> Result<()> {
        let cli = Cli::try_parse_from([
            "sexec", "--image", "/tmp/demo.img", "-p", "--writable", "/bin/sh", "-c", "id -u",
        ])?;
        let mut registry = Registry::new();
        cli.apply(&mut registry)?;

        assert_eq!(registry.get("IMAGE"), Some("/tmp/demo.img"));
        assert!(registry.is_set("UNSHARE_PID"));
        assert!(registry.is_set("WRITABLE"));
        assert!(!registry.is_set("UNSHARE_NET"));
        assert_eq!(cli.command, ["/bin/sh", "-c", "id -u"]);
        Ok(())
    }

    #[test]
    fn test_log_level_from_flags() -> Result<()> {
        let cli = Cli::try_parse_from(["sexec", "-vv", "true"])?;
        assert_eq!(cli.log_level(), "debug");

        let cli = Cli::try_parse_from(["sexec", "-q", "true"])?;
        assert_eq!(cli.log_level(), "error");
        Ok(())
    }
}
