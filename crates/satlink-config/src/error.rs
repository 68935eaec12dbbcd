//! Errors raised while loading or saving `config.ron`.

use std::path::PathBuf;

/// Why the receiver configuration could not be loaded or saved.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The config directory or file could not be written.
    #[error("cannot write {}: {source}", .path.display())]
    Write {
        /// Directory or file that was being written.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid RON for [`Config`](crate::Config).
    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        /// File that was being parsed.
        path: PathBuf,
        /// Position and cause reported by the RON parser.
        #[source]
        source: ron::error::SpannedError,
    },

    /// The in-memory config could not be rendered as RON.
    #[error("cannot serialize config: {0}")]
    Serialize(#[source] ron::Error),

    /// A value parses but cannot be used to reach a receiver.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending setting, e.g. `device.port`.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}
