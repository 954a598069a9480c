use num_enum::IntoPrimitive;
use thiserror::Error;

/// Failure classes of the runtime. Everything else travels as a plain
/// `anyhow::Error` and is treated as an abort.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("denied by policy: {0}")]
    Policy(String),

    #[error("privilege operation failed: {0}")]
    Privilege(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("{0}")]
    Usage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Usage = 1,
    Abort = 255,
}

impl ExitCode {
    /// Maps a failure that reached `main` onto the process exit code.
    pub fn from_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<Error>() {
            Some(Error::Usage(_)) => ExitCode::Usage,
            _ => ExitCode::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_usage_errors_exit_with_one() {
        let error = anyhow::Error::new(Error::Usage("no command".into()));
        assert_eq!(i32::from(ExitCode::from_error(&error)), 1);
    }

    #[test]
    fn test_wrapped_policy_error_aborts() {
        let error = Err::<(), _>(Error::Policy("squashfs".into()))
            .context("mounting rootfs")
            .unwrap_err();
        assert_eq!(ExitCode::from_error(&error), ExitCode::Abort);
        assert_eq!(i32::from(ExitCode::Abort), 255);
    }

    #[test]
    fn test_untyped_errors_abort() {
        let error = anyhow::anyhow!("mount failed");
        assert_eq!(ExitCode::from_error(&error), ExitCode::Abort);
    }
}
