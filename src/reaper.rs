//! Termination of processes still running inside a build root.
//!
//! Unmounting fails with EBUSY while any process keeps the root as its
//! filesystem root, so deactivation reaps first: every live pid is checked
//! via its `/proc/<pid>/root` link and matching processes get SIGTERM.
//!
//! The scan must run to completion. A process that exits between
//! enumeration and the readlink is skipped silently; a signal that cannot
//! be delivered is logged and skipped. Neither aborts the reap.

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, instrument, warn};

/// Sends SIGTERM to every process whose filesystem root is `root_path`.
///
/// Returns the number of processes signalled.
#[instrument(fields(root_path = %root_path.display()))]
pub fn reap(root_path: &Path) -> usize {
    let Ok(entries) = fs::read_dir("/proc") else {
        warn!("failed to enumerate /proc, skipping reap");
        return 0;
    };

    let mut signalled = 0;

    for entry in entries.filter_map(|e| e.ok()) {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };

        if process_root(pid).as_deref() != Some(root_path) {
            continue;
        }

        debug!(pid, "terminating process chrooted into build root");
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => signalled += 1,
            Err(e) => warn!(pid, error = %e, "failed to signal process"),
        }
    }

    signalled
}

/// Resolves the filesystem root of a process, `None` if it cannot be read
/// (the process exited, or it is not ours to inspect).
fn process_root(pid: i32) -> Option<PathBuf> {
    fs::read_link(format!("/proc/{pid}/root")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reap_on_unused_path_signals_nothing() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        assert_eq!(reap(dir.path()), 0);
    }

    #[test]
    fn test_own_process_root_is_resolvable() {
        let root = process_root(std::process::id() as i32);
        assert_eq!(root, Some(PathBuf::from("/")));
    }

    #[test]
    fn test_missing_process_root_is_none() {
        // Pid 0 never has a /proc entry.
        assert_eq!(process_root(0), None);
    }
}
