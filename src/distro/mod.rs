//! Distro adapters: OS-image bootstrap and package operations.
//!
//! The lifecycle manager drives each adapter as a black box through the
//! [`DistroAdapter`] capability interface. Each step is one blocking
//! external-command invocation; a non-zero exit is terminal for the calling
//! operation (the lifecycle manager runs its own rollback, adapters never
//! retry).
//!
//! Selection happens once, at configuration-load time, through
//! [`DistroKind::adapter`]. The [`Adapter`] enum keeps dispatch tagged per
//! distro; nothing downstream switches on strings.

mod debian;
mod fedora;

pub use debian::DebianAdapter;
pub use fedora::FedoraAdapter;

use std::process::Command;

use tracing::debug;

use crate::config::DistroKind;
use crate::error::RootError;
use crate::root::Root;

/// Capability interface every distro adapter provides.
pub trait DistroAdapter {
    /// Populates an empty root directory with a base OS image.
    fn bootstrap(
        &self,
        root: &Root,
        arch: Option<&str>,
        mirror: Option<&str>,
    ) -> Result<(), RootError>;

    /// Refreshes package indexes and applies pending upgrades inside the
    /// root.
    fn update_packages(&self, root: &Root) -> Result<(), RootError>;

    /// Installs `packages` inside the root.
    fn install_packages(&self, root: &Root, packages: &[String]) -> Result<(), RootError>;

    /// Drops package-manager caches inside the root.
    fn clean_packages(&self, root: &Root) -> Result<(), RootError>;
}

/// Tagged adapter variants, one per supported distro.
#[derive(Debug, Clone, Copy)]
pub enum Adapter {
    Debian(DebianAdapter),
    Fedora(FedoraAdapter),
}

impl DistroKind {
    /// Returns the adapter implementing this distro's operations.
    #[must_use]
    pub fn adapter(self) -> Adapter {
        match self {
            Self::Debian => Adapter::Debian(DebianAdapter),
            Self::Fedora => Adapter::Fedora(FedoraAdapter),
        }
    }
}

impl DistroAdapter for Adapter {
    fn bootstrap(
        &self,
        root: &Root,
        arch: Option<&str>,
        mirror: Option<&str>,
    ) -> Result<(), RootError> {
        match self {
            Self::Debian(adapter) => adapter.bootstrap(root, arch, mirror),
            Self::Fedora(adapter) => adapter.bootstrap(root, arch, mirror),
        }
    }

    fn update_packages(&self, root: &Root) -> Result<(), RootError> {
        match self {
            Self::Debian(adapter) => adapter.update_packages(root),
            Self::Fedora(adapter) => adapter.update_packages(root),
        }
    }

    fn install_packages(&self, root: &Root, packages: &[String]) -> Result<(), RootError> {
        match self {
            Self::Debian(adapter) => adapter.install_packages(root, packages),
            Self::Fedora(adapter) => adapter.install_packages(root, packages),
        }
    }

    fn clean_packages(&self, root: &Root) -> Result<(), RootError> {
        match self {
            Self::Debian(adapter) => adapter.clean_packages(root),
            Self::Fedora(adapter) => adapter.clean_packages(root),
        }
    }
}

/// Runs a host command to completion, mapping any failure to an adapter
/// error.
pub(crate) fn run_host_command(program: &str, args: &[String]) -> Result<(), RootError> {
    debug!(program, ?args, "running adapter host command");

    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|e| RootError::Adapter {
            command: program.to_string(),
            detail: e.to_string(),
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(RootError::Adapter {
            command: format!("{program} {}", args.join(" ")),
            detail: format!("exited with {status}"),
        })
    }
}

/// Runs a command as root inside the build root, mapping a failing exit to
/// an adapter error.
pub(crate) fn run_in_root(root: &Root, command: &str) -> Result<(), RootError> {
    if root.run(command, true)? {
        Ok(())
    } else {
        Err(RootError::Adapter {
            command: command.to_string(),
            detail: "exited with failure".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_selection_is_tagged() {
        assert!(matches!(DistroKind::Debian.adapter(), Adapter::Debian(_)));
        assert!(matches!(DistroKind::Fedora.adapter(), Adapter::Fedora(_)));
    }
}
