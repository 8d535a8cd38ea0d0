//! Error handling stuff
use displaydoc::Display;
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::warn;

/// Error type for [`crate::sysfs`]
#[derive(Debug, Display, Error)]
pub enum SysfsError {
    /// Control-plane path `{0}` does not exist
    Missing(PathBuf),

    /// No write permission for `{0}`
    PermissionDenied(PathBuf),

    /// IO on `{path}` failed: {source}
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Write to `{path}` was rejected with result `{result}`
    Rejected { path: PathBuf, result: String },

    /// Write to `{path}` did not complete within {after:?}
    Timeout { path: PathBuf, after: Duration },
}

impl SysfsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Error type for [`crate::config::parser`]
#[derive(Debug, Display, Error)]
pub enum ParseError {
    /// Couldn't read configuration: {0}
    Io(#[from] io::Error),

    /// line {line}: `{keyword}` block is missing a name
    MissingName { line: usize, keyword: String },

    /// line {line}: unmatched braces in `{keyword}` block
    UnmatchedBraces { line: usize, keyword: String },

    /// line {line}: closing brace without a matching block
    StrayBrace { line: usize },

    /// line {line}: malformed LUN definition `{text}`
    MalformedLun { line: usize, text: String },

    /// line {line}: malformed attribute `{text}`
    MalformedAttribute { line: usize, text: String },

    /// line {line}: {source}
    Model {
        line: usize,
        #[source]
        source: ConfigError,
    },
}

/// Error type for [`crate::config`]
#[derive(Debug, Display, Error)]
pub enum ConfigError {
    /// Unknown handler type `{handler}` for device `{device}`
    UnknownHandler { handler: String, device: String },
}

/// Error type for [`crate::modules`]
#[derive(Debug, Display, Error)]
pub enum ModuleError {
    /// IO Failed
    Io(#[from] io::Error),

    /// Couldn't load module {0}: {1}
    LoadError(String, String),

    /// Required kernel modules failed to load: {0:?}
    RequiredMissing(Vec<String>),
}

/// Umbrella error type for [`crate::admin`]
#[derive(Debug, Display, Error)]
pub enum Error {
    /// SCST is not available at `{0}`, is the `scst` module loaded?
    Unavailable(PathBuf),

    /// Suspend value must be positive, got {0}
    InvalidSuspend(i64),

    /// {0}
    Sysfs(#[from] SysfsError),

    /// {0}
    Parse(#[from] ParseError),

    /// {0}
    Config(#[from] ConfigError),

    /// {0}
    Module(#[from] ModuleError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Marks an operation whose failure must not stop convergence.
///
/// The failure is logged at `warn` and the caller continues with [`None`].
pub trait BestEffort<T> {
    fn best_effort(self, what: &str) -> Option<T>;
}

impl<T, E: std::fmt::Display> BestEffort<T> for std::result::Result<T, E> {
    fn best_effort(self, what: &str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "{what} failed, continuing");
                None
            }
        }
    }
}

/// Error text.
pub(crate) mod text {
    pub const NOT_FOUND: &str = "not found";

    pub const TIMED_OUT: &str = "timed out";
}
