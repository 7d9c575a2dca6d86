//! # Error Types
//!
//! Defines a structured error hierarchy for the sync engine using `thiserror`.
//! Each error variant carries enough context for meaningful diagnostics without
//! exposing internal implementation details to the caller.
//!
//! The CLI maps errors onto the engine's fixed exit codes via
//! [`CumulusError::exit_code`].

use std::path::PathBuf;
use thiserror::Error;

/// Exit code: global configuration file not found.
pub const EXIT_GLB_CONF_NOT_FOUND: i32 = -1;
/// Exit code: cloud-specific configuration file not found.
pub const EXIT_CLD_CONF_NOT_FOUND: i32 = -2;
/// Exit code: requested object not found.
pub const EXIT_OBJ_NOT_FOUND: i32 = -3;
/// Exit code: target file already exists.
pub const EXIT_FILE_EXISTS: i32 = -4;
/// Exit code: unrecognizable command line parameter.
pub const EXIT_BAD_CLI: i32 = -5;
/// Exit code: storage is not in a consistent state.
pub const EXIT_ASSERT_FAIL: i32 = -6;
/// Exit code: file does not exist.
pub const EXIT_FILE_NOT_EXISTS: i32 = -7;

/// Top-level error type encompassing all failure modes in the sync engine.
#[derive(Error, Debug)]
pub enum CumulusError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("decorator error: {0}")]
    Decorator(#[from] DecoratorError),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("target already exists: {0}")]
    TargetExists(PathBuf),

    #[error("no such file or directory: {0}")]
    FileNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("cloud configuration not found: {0}.conf")]
    CloudNotFound(String),

    #[error("malformed line {line} in {path}: expected KEY=VALUE")]
    Parse { path: PathBuf, line: usize },

    #[error("invalid configuration: {message}")]
    Validation { message: String },

    #[error("bad exclude pattern: {source}")]
    Pattern {
        #[from]
        source: globset::Error,
    },
}

/// Binary record encoding/decoding errors.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("invalid object id: {0:?}")]
    BadId(String),

    #[error("field is not valid UTF-8")]
    BadString,

    #[error("name too long for fixed field: {0:?}")]
    NameTooLong(String),
}

/// Blob store and snapshot store errors.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum BackendError {
    #[error("{namespace} not found on {backend}: {id}")]
    NotFound {
        backend: String,
        namespace: &'static str,
        id: String,
    },

    #[error("backend {backend} unavailable: {message}")]
    Unavailable { backend: String, message: String },

    #[error("unknown backend id: {0}")]
    Unknown(String),

    #[error("backend {backend} initialization failed after {attempts} attempts")]
    Init { backend: String, attempts: u32 },
}

/// Payload transform (compression/encryption) errors.
#[derive(Error, Debug)]
pub enum DecoratorError {
    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("decompression failed: payload corrupted")]
    Decompress,

    #[error("decryption failed: authentication tag mismatch (corrupted or wrong key)")]
    Decrypt,

    #[error("encryption required but no key configured")]
    MissingKey,
}

impl CumulusError {
    /// Returns true for failures worth a second attempt (network-ish errors).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CumulusError::Backend(BackendError::Unavailable { .. }) | CumulusError::Io(_)
        )
    }

    /// Maps an error onto the engine's fixed process exit codes.
    pub fn exit_code(&self) -> i32 {
        match self {
            CumulusError::Config(ConfigError::CloudNotFound(_)) => EXIT_CLD_CONF_NOT_FOUND,
            CumulusError::Config(_) => EXIT_GLB_CONF_NOT_FOUND,
            CumulusError::Backend(BackendError::NotFound { .. }) => EXIT_OBJ_NOT_FOUND,
            CumulusError::TargetExists(_) => EXIT_FILE_EXISTS,
            CumulusError::Invariant(_) => EXIT_ASSERT_FAIL,
            CumulusError::FileNotFound(_) => EXIT_FILE_NOT_EXISTS,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CumulusError>;
