//! Build-root lifecycle management.
//!
//! A [`Root`] is a handle on one isolated filesystem tree used as a chroot
//! target. It owns the tree's on-disk path and its bind mounts for the
//! duration of every operation; the caller guarantees at most one lifecycle
//! operation runs against a given path at a time.
//!
//! # State machine
//!
//! ```text
//! Absent  --create/fetch-->  Ready
//! Ready   --clean-------->  Absent
//! Invalid --clean-------->  Absent
//! Ready/Invalid --update--> unchanged state (stamp untouched)
//! ```
//!
//! State is derived, never stored: `Absent` means no root directory,
//! `Ready` means the directory exists and the stamp file matches the
//! configured stamp, `Invalid` means it exists with a stale stamp (the
//! configuration changed since the root was built). The stamp file at
//! `<root_path>.stamp` is the only persisted state beyond the tree itself.

mod exec;
mod lifecycle;

pub use exec::SANDBOX_MARKER;

pub(crate) use lifecycle::RemoveDirOnDrop;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{HostUser, RootConfig, DEFAULT_VAR_DIR};
use crate::error::RootError;

/// Name of the non-privileged account created inside every build root.
pub const ACCOUNT_NAME: &str = "rootbox";

/// Derived validity of a build root on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootState {
    /// No root directory.
    Absent,
    /// Root directory present, stamp matches the configuration.
    Ready,
    /// Root directory present, stamp stale or unreadable.
    Invalid,
}

impl fmt::Display for RootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Ready => write!(f, "ready"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// Handle on one build root.
#[derive(Debug, Clone)]
pub struct Root {
    config: RootConfig,
    host_user: HostUser,
    var_dir: PathBuf,
    path: PathBuf,
}

impl Root {
    /// Creates a handle for the build root described by `config`.
    #[must_use]
    pub fn new(config: RootConfig, host_user: HostUser) -> Self {
        let var_dir = PathBuf::from(DEFAULT_VAR_DIR);
        let path = config.compute_path(&var_dir);

        Self {
            config,
            host_user,
            var_dir,
            path,
        }
    }

    /// Overrides the storage directory (and with it the computed path).
    #[must_use]
    pub fn with_var_dir(mut self, var_dir: impl Into<PathBuf>) -> Self {
        self.var_dir = var_dir.into();
        self.path = self.config.compute_path(&self.var_dir);
        self
    }

    /// The build root's on-disk path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The configuration this handle was built from.
    #[must_use]
    pub fn config(&self) -> &RootConfig {
        &self.config
    }

    /// The invoking user's numeric ids.
    #[must_use]
    pub fn host_user(&self) -> HostUser {
        self.host_user
    }

    /// Directory build roots and transfer scratch files live under.
    #[must_use]
    pub(crate) fn var_dir(&self) -> &Path {
        &self.var_dir
    }

    /// Whether the root directory exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Derives the current state per the stamp-comparison rule.
    ///
    /// Does not mutate anything. A missing stamp file reads as the empty
    /// string, so it only matches an empty configured stamp.
    #[must_use]
    pub fn state(&self) -> RootState {
        if !self.exists() {
            return RootState::Absent;
        }

        if self.read_stamp() == self.config.stamp {
            RootState::Ready
        } else {
            RootState::Invalid
        }
    }

    /// Path of the stamp marker file, a sibling of the root directory.
    #[must_use]
    pub fn stamp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".stamp");
        self.path.with_file_name(name)
    }

    fn read_stamp(&self) -> String {
        fs::read_to_string(self.stamp_path()).unwrap_or_default()
    }

    /// Writes the configured stamp to the marker file.
    pub(crate) fn write_stamp(&self) -> Result<(), RootError> {
        fs::write(self.stamp_path(), &self.config.stamp).map_err(|e| RootError::Io {
            context: format!("failed to write stamp file: {}", self.stamp_path().display()),
            source: e,
        })
    }
}
