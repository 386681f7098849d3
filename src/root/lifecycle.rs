//! Activation, creation and teardown of build roots.
//!
//! Every operation here is a blocking sequence of external-process and
//! filesystem steps with no internal parallelism. The two cleanup
//! guarantees live in this module:
//!
//! - `create` (and `fetch`) are all-or-nothing: a remove-on-drop guard
//!   deletes the partially built tree on any failure, early return or
//!   panic before the stamp is written.
//! - Every operation that activates the root deactivates it on the way
//!   out, success or failure, so no mounts leak past the operation that
//!   made them.

use std::fs;
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::distro::DistroAdapter;
use crate::error::RootError;
use crate::mounts;
use crate::reaper;

use super::Root;

/// Removes a directory tree on drop unless disarmed.
///
/// Scoped acquisition of a partially built root: the guard is armed right
/// after the directory is created and disarmed only once the tree is
/// complete and stamped, so interrupts and propagated errors both roll the
/// directory back.
pub(crate) struct RemoveDirOnDrop<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> RemoveDirOnDrop<'a> {
    pub(crate) fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RemoveDirOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!(path = %self.path.display(), "removing partially built root");
        if let Err(e) = fs::remove_dir_all(self.path) {
            warn!(path = %self.path.display(), error = %e, "rollback failed");
        }
    }
}

impl Root {
    /// Binds host resources into the build root and installs the host's
    /// DNS resolver configuration.
    ///
    /// Re-entrant: mounts already present in the host mount table are left
    /// alone, so calling this twice produces the same mount set as calling
    /// it once. A resolved mount whose destination does not exist in the
    /// tree is skipped, tolerating partially-populated images.
    ///
    /// # Errors
    ///
    /// Returns `RootError::NotFound` if the root does not exist, or
    /// `RootError::Mount` if a bind mount fails.
    #[instrument(skip(self), fields(path = %self.path().display()))]
    pub fn activate(&self) -> Result<(), RootError> {
        self.require_exists()?;

        let mounted = mounts::mounted_points()?;

        for entry in mounts::resolve_mounts(self.config(), self.path()) {
            if mounted.contains(&entry.dest) {
                continue;
            }

            if !entry.dest.exists() {
                debug!(dest = %entry.dest.display(), "mount destination missing, skipping");
                continue;
            }

            mounts::bind_mount(&entry.source, &entry.dest)?;
        }

        self.setup_dns()
    }

    /// Reaps processes still rooted in the build root, then unmounts every
    /// resolved mount currently present, in reverse mount order.
    ///
    /// Safe to call when some or none of the mounts are present.
    ///
    /// # Errors
    ///
    /// Returns `RootError::Unmount` if a mounted destination cannot be
    /// released.
    #[instrument(skip(self), fields(path = %self.path().display()))]
    pub fn deactivate(&self) -> Result<(), RootError> {
        let signalled = reaper::reap(self.path());
        if signalled > 0 {
            debug!(signalled, "terminated processes before unmounting");
        }

        let mounted = mounts::mounted_points()?;

        for entry in mounts::resolve_mounts(self.config(), self.path())
            .iter()
            .rev()
        {
            if mounted.contains(&entry.dest) {
                mounts::unmount(&entry.dest)?;
            }
        }

        Ok(())
    }

    /// Runs `operation` with the root activated, deactivating afterwards no
    /// matter how the operation ends.
    ///
    /// A deactivation failure after a failed operation is logged rather
    /// than raised, so the operation's own error is what propagates.
    pub(crate) fn with_active<T>(
        &self,
        operation: impl FnOnce(&Self) -> Result<T, RootError>,
    ) -> Result<T, RootError> {
        self.activate()?;

        let result = operation(self);
        let released = self.deactivate();

        match result {
            Ok(value) => released.map(|()| value),
            Err(e) => {
                if let Err(release_err) = released {
                    warn!(error = %release_err, "deactivation failed while propagating earlier error");
                }
                Err(e)
            }
        }
    }

    /// Creates the build root: bootstrap, account setup, package
    /// installation, stamp.
    ///
    /// All-or-nothing: any failure (including interruption) removes the
    /// partially built directory before the error propagates.
    ///
    /// # Errors
    ///
    /// Returns `RootError::AlreadyExists` if the root is present in any
    /// state, or the first error of the failing step.
    pub fn create(&self, arch: Option<&str>, mirror: Option<&str>) -> Result<(), RootError> {
        let adapter = self.config().distro.adapter();
        self.create_with(&adapter, arch, mirror)
    }

    /// [`create`](Self::create) with an explicit adapter.
    ///
    /// The seam exists so rollback behavior can be exercised with an
    /// injected adapter.
    #[instrument(skip(self, adapter), fields(path = %self.path().display()))]
    pub fn create_with(
        &self,
        adapter: &dyn DistroAdapter,
        arch: Option<&str>,
        mirror: Option<&str>,
    ) -> Result<(), RootError> {
        if self.exists() {
            return Err(RootError::AlreadyExists {
                path: self.path().to_path_buf(),
            });
        }

        fs::create_dir_all(self.path()).map_err(|e| RootError::Io {
            context: format!("failed to create root directory: {}", self.path().display()),
            source: e,
        })?;

        let rollback = RemoveDirOnDrop::new(self.path());

        adapter.bootstrap(self, arch, mirror)?;

        self.setup_system_dirs()?;
        self.create_account()?;
        self.setup_accounts()?;

        self.with_active(|root| {
            root.install_packages(adapter)?;
            adapter.clean_packages(root)
        })?;

        self.write_stamp()?;
        rollback.disarm();

        info!(path = %self.path().display(), "build root created");
        Ok(())
    }

    /// Re-runs the adapter's update, install and clean steps for the
    /// current package configuration.
    ///
    /// Does not touch the stamp: a root left `Invalid` by a configuration
    /// change stays `Invalid` until rebuilt.
    ///
    /// # Errors
    ///
    /// Returns `RootError::NotFound` if the root does not exist; adapter
    /// failures propagate after deactivation.
    #[instrument(skip(self), fields(path = %self.path().display()))]
    pub fn update(&self) -> Result<(), RootError> {
        self.require_exists()?;

        let adapter = self.config().distro.adapter();

        self.with_active(|root| {
            root.install_packages(&adapter)?;
            adapter.clean_packages(root)
        })
    }

    /// Deactivates and removes the build root and its stamp.
    ///
    /// Removing the stamp is best-effort: it may never have been written.
    ///
    /// # Errors
    ///
    /// Returns `RootError::NotFound` if the root does not exist (cleaning
    /// nothing is reported, not silently accepted).
    #[instrument(skip(self), fields(path = %self.path().display()))]
    pub fn clean(&self) -> Result<(), RootError> {
        self.require_exists()?;

        self.deactivate()?;

        fs::remove_dir_all(self.path()).map_err(|e| RootError::Io {
            context: format!("failed to remove root directory: {}", self.path().display()),
            source: e,
        })?;

        let _ = fs::remove_file(self.stamp_path());

        info!(path = %self.path().display(), "build root removed");
        Ok(())
    }

    pub(crate) fn require_exists(&self) -> Result<(), RootError> {
        if self.exists() {
            Ok(())
        } else {
            Err(RootError::NotFound {
                path: self.path().to_path_buf(),
            })
        }
    }

    /// Runs the full package pass: index update, install of the flattened
    /// union, then the optional extras (sudo grant, npm, pypi).
    fn install_packages(&self, adapter: &dyn DistroAdapter) -> Result<(), RootError> {
        adapter.update_packages(self)?;

        let packages = self.config().flattened_packages();
        adapter.install_packages(self, &packages)?;

        if wants_sudo(&packages) {
            self.grant_sudo()?;
        }

        self.install_npm_packages()?;
        self.install_pypi_packages()
    }

    /// Copies the host's resolver configuration so networked commands work
    /// inside the root.
    fn setup_dns(&self) -> Result<(), RootError> {
        let dest = self.path().join("etc/resolv.conf");

        fs::copy("/etc/resolv.conf", &dest)
            .map(drop)
            .map_err(|e| RootError::Io {
                context: format!("failed to install resolver configuration: {}", dest.display()),
                source: e,
            })
    }

    /// Creates the auxiliary directories the fixed mounts and the shared
    /// memory path expect inside a fresh tree.
    fn setup_system_dirs(&self) -> Result<(), RootError> {
        let mut dirs = vec!["var/run/dbus", "run/udev"];
        if mounts::shm_source() == "/run/shm" {
            dirs.push("run/shm");
        }

        for dir in dirs {
            let full = self.path().join(dir);
            fs::create_dir_all(&full).map_err(|e| RootError::Io {
                context: format!("failed to create directory: {}", full.display()),
                source: e,
            })?;
        }

        Ok(())
    }
}

/// Whether the package set asks for passwordless privilege escalation.
pub(crate) fn wants_sudo(packages: &[String]) -> bool {
    packages.iter().any(|p| p == "sudo")
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_root;
    use super::*;
    use crate::error::RootError;

    struct FailingAdapter;

    impl DistroAdapter for FailingAdapter {
        fn bootstrap(
            &self,
            _root: &Root,
            _arch: Option<&str>,
            _mirror: Option<&str>,
        ) -> Result<(), RootError> {
            Err(RootError::Adapter {
                command: "bootstrap".to_string(),
                detail: "simulated failure".to_string(),
            })
        }

        fn update_packages(&self, _root: &Root) -> Result<(), RootError> {
            Ok(())
        }

        fn install_packages(&self, _root: &Root, _packages: &[String]) -> Result<(), RootError> {
            Ok(())
        }

        fn clean_packages(&self, _root: &Root) -> Result<(), RootError> {
            Ok(())
        }
    }

    #[test]
    fn test_create_rolls_back_on_bootstrap_failure() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let root = test_root("v1", dir.path());

        let result = root.create_with(&FailingAdapter, None, None);

        assert!(matches!(result, Err(RootError::Adapter { .. })));
        assert!(!root.exists(), "partial root must be removed");
    }

    #[test]
    fn test_create_rejects_existing_root() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let root = test_root("v1", dir.path());

        fs::create_dir_all(root.path()).unwrap();

        let result = root.create_with(&FailingAdapter, None, None);

        assert!(matches!(result, Err(RootError::AlreadyExists { .. })));
        assert!(root.exists(), "pre-existing root must be left alone");
    }

    #[test]
    fn test_activate_requires_existing_root() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let root = test_root("v1", dir.path());

        assert!(matches!(root.activate(), Err(RootError::NotFound { .. })));
    }

    #[test]
    fn test_update_requires_existing_root() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let root = test_root("v1", dir.path());

        assert!(matches!(root.update(), Err(RootError::NotFound { .. })));
    }

    #[test]
    fn test_clean_on_absent_root_is_an_error() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let root = test_root("v1", dir.path());

        assert!(matches!(root.clean(), Err(RootError::NotFound { .. })));
    }

    #[test]
    fn test_clean_removes_tree_and_stamp() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let root = test_root("v1", dir.path());

        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/hostname"), "x\n").unwrap();
        root.write_stamp().unwrap();

        root.clean().expect("clean failed");

        assert!(!root.exists());
        assert!(!root.stamp_path().exists());
        assert_eq!(root.state(), crate::root::RootState::Absent);
    }

    #[test]
    fn test_deactivate_with_no_mounts_is_safe() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let root = test_root("v1", dir.path());

        fs::create_dir_all(root.path()).unwrap();

        root.deactivate().expect("deactivate with no mounts failed");
        assert!(root.exists());
    }

    #[test]
    fn test_remove_dir_on_drop_disarm() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let target = dir.path().join("tree");
        fs::create_dir_all(&target).unwrap();

        let guard = RemoveDirOnDrop::new(&target);
        guard.disarm();
        assert!(target.exists());

        drop(RemoveDirOnDrop::new(&target));
        assert!(!target.exists());
    }

    #[test]
    fn test_wants_sudo() {
        let with = vec!["bash".to_string(), "sudo".to_string()];
        let without = vec!["bash".to_string(), "sudoku".to_string()];

        assert!(wants_sudo(&with));
        assert!(!wants_sudo(&without));
    }
}
