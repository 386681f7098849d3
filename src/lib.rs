//! rootbox - chroot build-root lifecycle manager.
//!
//! This crate manages the full lifecycle of an isolated filesystem root
//! used to build and run software inside a chroot-style environment:
//! creating a base OS image, binding host resources into it, installing
//! packages, executing commands with privilege control, and tearing it
//! down without leaking mounts or orphaned processes.
//!
//! Isolation is bind mounts plus chroot only; there are no namespaces,
//! cgroups or network virtualization, and the tool must run as root
//! (through sudo, so the invoking user's identity is still known).
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use rootbox::{HostUser, Root, RootConfig, RootState};
//!
//! fn main() -> rootbox::Result<()> {
//!     let config = RootConfig::load(Path::new("rootbox.json"))?;
//!     let root = Root::new(config, HostUser::from_env()?);
//!
//!     if root.state() == RootState::Absent {
//!         root.create(None, None)?;
//!     }
//!
//!     root.run("make check", false)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod distro;
pub mod error;
pub mod mounts;
pub mod reaper;
pub mod root;
pub mod transfer;

// Re-export commonly used types
pub use config::{DistroKind, HostUser, PrebuiltImage, RootConfig};
pub use error::{Error, Result};
pub use root::{Root, RootState, SANDBOX_MARKER};
