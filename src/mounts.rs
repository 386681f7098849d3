//! Mount table resolution and bind-mount plumbing.
//!
//! The resolver computes, from the configuration and the current host
//! filesystem state, the ordered set of host path to root path bind mounts a
//! build root needs while active. Ordering is part of the contract:
//! user-declared mounts come first, the fixed system mounts after, and
//! deactivation unmounts in exact reverse so nested mounts are released
//! before their parents.
//!
//! The table is recomputed on every activation and deactivation; the host
//! mount table (`/proc/mounts`) is the only source of truth for what is
//! currently mounted. There is no cached "activated" flag to go stale.

use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{debug, trace, warn};

use crate::config::RootConfig;
use crate::error::RootError;

/// Fixed system sources bind-mounted into every active build root, in mount
/// order. Each is included only when present on the host.
const SYSTEM_MOUNT_SOURCES: &[&str] = &[
    "/dev",
    "/dev/pts",
    "/sys",
    "/proc",
    "/tmp",
    "/var/run/dbus",
    "/run/udev",
];

/// An ordered host-to-root bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Absolute path on the host.
    pub source: PathBuf,
    /// Destination inside the build root.
    pub dest: PathBuf,
}

/// Picks the host's shared-memory path.
///
/// Hosts expose exactly one of the two candidates; mounting the one that
/// does not exist would fail, so the choice is a predicate on host state.
#[must_use]
pub fn shm_source() -> &'static str {
    if Path::new("/run/shm").exists() {
        "/run/shm"
    } else {
        "/dev/shm"
    }
}

/// Computes the ordered mount table for a build root.
///
/// User mounts first (sources made absolute, destinations joined under
/// `root_path`), then the fixed system sources in their fixed sequence,
/// each re-rooted under `root_path` and included only if it exists on the
/// host. Pure function of the configuration and host `stat` results; no
/// side effects.
#[must_use]
pub fn resolve_mounts(config: &RootConfig, root_path: &Path) -> Vec<MountEntry> {
    let mut entries = Vec::new();

    for (source, dest) in &config.user_mounts {
        entries.push(MountEntry {
            source: crate::config::absolutize(source),
            dest: root_path.join(strip_leading_root(dest)),
        });
    }

    for source in SYSTEM_MOUNT_SOURCES
        .iter()
        .copied()
        .chain(std::iter::once(shm_source()))
    {
        let source = Path::new(source);
        if source.exists() {
            entries.push(MountEntry {
                source: source.to_path_buf(),
                dest: root_path.join(strip_leading_root(source)),
            });
        }
    }

    entries
}

fn strip_leading_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

/// Returns the destinations currently present in the host mount table.
///
/// # Errors
///
/// Returns `RootError::Io` if `/proc/mounts` cannot be read.
pub fn mounted_points() -> Result<Vec<PathBuf>, RootError> {
    let mounts = fs::read_to_string("/proc/mounts").map_err(|e| RootError::Io {
        context: "failed to read /proc/mounts".to_string(),
        source: e,
    })?;

    Ok(parse_mounted_points(&mounts))
}

/// Extracts mount points from `/proc/mounts` content.
///
/// Format: `device mount_point fs_type options ...` per line. Whitespace in
/// mount points is octal-escaped (`\040`), which is decoded so paths
/// compare correctly against the resolved table.
fn parse_mounted_points(mounts: &str) -> Vec<PathBuf> {
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .collect()
}

fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }

    out
}

/// Bind-mounts `source` onto `dest`.
///
/// # Errors
///
/// Returns `RootError::Mount` if the mount syscall fails.
pub fn bind_mount(source: &Path, dest: &Path) -> Result<(), RootError> {
    trace!(source = %source.display(), dest = %dest.display(), "bind mounting");

    mount(
        Some(source),
        dest,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| RootError::Mount {
        host_path: source.to_path_buf(),
        target: dest.to_path_buf(),
        errno: std::io::Error::from_raw_os_error(e as i32),
    })
}

/// Unmounts `target`, falling back to a lazy unmount if the plain one fails.
///
/// # Errors
///
/// Returns `RootError::Unmount` if both attempts fail.
pub fn unmount(target: &Path) -> Result<(), RootError> {
    trace!(target = %target.display(), "unmounting");

    match umount2(target, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(target = %target.display(), error = %e, "unmount failed, trying lazy unmount");

            umount2(target, MntFlags::MNT_DETACH).map_err(|e| RootError::Unmount {
                target: target.to_path_buf(),
                errno: std::io::Error::from_raw_os_error(e as i32),
            })?;

            debug!(target = %target.display(), "unmounted with MNT_DETACH");
            Ok(())
        }
    }
}
