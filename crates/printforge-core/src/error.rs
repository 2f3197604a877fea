//! Error handling for printforge
//!
//! Provides error types for all layers of the firmware core:
//! - G-code errors (malformed lines, unknown codes, bad parameters)
//! - Platform errors (board I/O, file store, messaging)
//! - Config errors (non-volatile store access and validation)
//!
//! All error types use `thiserror`. Command handlers report failures on the
//! reply channel and advance; these types are for the programmatic seams
//! (file store, config backend, collaborator traits).

use thiserror::Error;

/// Command error, reported on the reply channel of the source the
/// command came from. The command counts as done and the dispatcher
/// advances.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GcodeError {
    /// G code number is not recognised
    #[error("invalid G Code: {line}")]
    UnknownG {
        /// The offending line text.
        line: String,
    },

    /// M code number is not recognised
    #[error("invalid M Code: {line}")]
    UnknownM {
        /// The offending line text.
        line: String,
    },

    /// A parameter value was out of range
    #[error("parameter {letter} out of range: {value}")]
    ParameterOutOfRange {
        /// The parameter letter.
        letter: char,
        /// The rejected value.
        value: f64,
    },

    /// A required macro file was not found
    #[error("Macro file {name} not found")]
    MacroNotFound {
        /// File name under the sys directory.
        name: String,
    },
}

/// Platform-level error
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Filesystem operation failed
    #[error("File store error: {0}")]
    FileStore(#[from] std::io::Error),

    /// All file table entries are in use
    #[error("Max open file count exceeded")]
    FileTableFull,

    /// The output buffer pool is exhausted
    #[error("Output buffer pool exhausted")]
    NoOutputBuffers,

    /// A drive or heater index was out of range
    #[error("Index {index} out of range for {what}")]
    BadIndex {
        /// What kind of resource was indexed.
        what: &'static str,
        /// The rejected index.
        index: usize,
    },
}

/// Non-volatile configuration store error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Backend read/write failed
    #[error("Non-volatile store I/O: {0}")]
    Backend(#[from] std::io::Error),

    /// The record failed to encode or decode
    #[error("Non-volatile record codec: {0}")]
    Codec(String),
}

/// Top-level error wrapper
#[derive(Error, Debug)]
pub enum Error {
    /// G-code error
    #[error(transparent)]
    Gcode(#[from] GcodeError),

    /// Platform error
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Config error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias used throughout the workspace
pub type Result<T> = std::result::Result<T, Error>;
