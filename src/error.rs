//! Error types for rootbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Configuration could not be loaded or is incomplete
    #[error("configuration error")]
    #[diagnostic(code(rootbox::config))]
    Config(#[from] ConfigError),

    /// A build-root lifecycle operation failed
    #[error("build root operation failed")]
    #[diagnostic(code(rootbox::root))]
    Root(#[from] RootError),

    /// Image distribution or fetch failed
    #[error("image transfer failed")]
    #[diagnostic(code(rootbox::transfer))]
    Transfer(#[from] TransferError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(rootbox::io))]
    Io(#[from] std::io::Error),
}

/// Errors related to loading the configuration document and resolving the
/// invoking user.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("failed to read configuration file: {}", .path.display())]
    #[diagnostic(code(rootbox::config::read))]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for the expected schema
    #[error("failed to parse configuration file: {}", .path.display())]
    #[diagnostic(
        code(rootbox::config::parse),
        help("the document must be a JSON object with at least a \"name\" field")
    )]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The invoking user's numeric ids are not available
    #[error("missing {variable} in the environment")]
    #[diagnostic(
        code(rootbox::config::invoker),
        help("run through sudo so SUDO_UID and SUDO_GID identify the invoking user")
    )]
    MissingInvokerId { variable: &'static str },

    /// The invoking user's numeric ids are not numeric
    #[error("{variable} is not a numeric id: {value}")]
    #[diagnostic(code(rootbox::config::invoker))]
    InvalidInvokerId {
        variable: &'static str,
        value: String,
    },
}

/// Errors raised by build-root lifecycle operations.
#[derive(Error, Debug, Diagnostic)]
pub enum RootError {
    /// create/fetch attempted over an existing build root
    #[error("the build root already exists: {}", .path.display())]
    #[diagnostic(
        code(rootbox::root::already_exists),
        help("run `clean` first to remove the existing build root")
    )]
    AlreadyExists { path: PathBuf },

    /// An operation that requires an existing build root found none
    #[error("the build root does not exist: {}", .path.display())]
    #[diagnostic(
        code(rootbox::root::not_found),
        help("create or fetch the build root first")
    )]
    NotFound { path: PathBuf },

    /// A distro adapter step (bootstrap or package operation) failed
    #[error("adapter step failed: {command}: {detail}")]
    #[diagnostic(code(rootbox::root::adapter))]
    Adapter { command: String, detail: String },

    /// A bind mount could not be established
    #[error("failed to bind mount {} onto {}", .host_path.display(), .target.display())]
    #[diagnostic(code(rootbox::root::mount))]
    Mount {
        host_path: PathBuf,
        target: PathBuf,
        #[source]
        errno: std::io::Error,
    },

    /// A mount point could not be released
    #[error("failed to unmount {}", .target.display())]
    #[diagnostic(code(rootbox::root::unmount))]
    Unmount {
        target: PathBuf,
        #[source]
        errno: std::io::Error,
    },

    /// Account or environment setup inside the build root failed
    #[error("build root setup failed: {context}")]
    #[diagnostic(code(rootbox::root::setup))]
    Setup { context: String },

    /// A command could not be executed inside the build root
    #[error("failed to execute in build root: {command}")]
    #[diagnostic(code(rootbox::root::exec))]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem operation on the build root failed
    #[error("{context}")]
    #[diagnostic(code(rootbox::root::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while distributing or fetching prebuilt images.
#[derive(Error, Debug, Diagnostic)]
pub enum TransferError {
    /// fetch requested but the configuration names no prebuilt image
    #[error("no prebuilt image configured")]
    #[diagnostic(
        code(rootbox::transfer::no_prebuilt),
        help("add a \"prebuilt\" section with \"name\" and \"url\" to the configuration")
    )]
    NoPrebuilt,

    /// Network failure resolving or downloading the archive
    #[error("download failed: {url}")]
    #[diagnostic(code(rootbox::transfer::download))]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Failure producing the distribution archive
    #[error("failed to archive build root: {context}")]
    #[diagnostic(code(rootbox::transfer::archive))]
    Archive {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Downloaded archive could not be extracted
    #[error("failed to extract archive: {context}")]
    #[diagnostic(code(rootbox::transfer::extract))]
    Extract { context: String },

    /// Scratch-file or filesystem failure during transfer
    #[error("{context}")]
    #[diagnostic(code(rootbox::transfer::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
