//! Command execution inside the build root, and the account setup that
//! supports it.
//!
//! Execution is deterministic by construction: the environment is an
//! explicit map built from scratch for every run, never the ambient
//! process environment, and the ambient environment is never mutated. Only
//! a small allow-list of host variables (proxies, and display plumbing for
//! interactive runs) crosses into the root.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::chown;
use std::process::Command;

use tracing::{debug, instrument};

use crate::error::RootError;

use super::{Root, ACCOUNT_NAME};

/// Search path exported inside the build root.
const ROOT_PATH_VAR: &str = "/bin:/usr/bin:/usr/sbin";

/// Locale exported inside the build root.
const ROOT_LOCALE: &str = "C";

/// Variable marking a process as running inside a build root.
pub const SANDBOX_MARKER: &str = "ROOTBOX";

/// Host variables forwarded into every run.
const KEEP_ALWAYS: &[&str] = &["http_proxy", "https_proxy"];

/// Host variables additionally forwarded into non-root runs, which are the
/// interactive ones.
const KEEP_INTERACTIVE: &[&str] = &["DISPLAY", "XAUTHLOCALHOSTNAME", "TERM"];

impl Root {
    /// Runs a shell command inside the build root via chroot.
    ///
    /// Activates first and deactivates unconditionally afterwards, even
    /// when the command fails. Runs under the invoking user's numeric ids
    /// unless `as_root`. Returns whether the command exited successfully;
    /// a failing command is `Ok(false)`, not an error.
    ///
    /// # Errors
    ///
    /// Returns `RootError::NotFound` if the build root does not exist
    /// (checked before any mount operation), or `RootError::Exec` if the
    /// chroot process cannot be spawned.
    #[instrument(skip(self, command), fields(path = %self.path().display()))]
    pub fn run(&self, command: &str, as_root: bool) -> Result<bool, RootError> {
        self.require_exists()?;

        self.with_active(|root| {
            if !as_root {
                root.setup_xauth();
            }

            root.exec_chroot(command, as_root)
        })
    }

    fn exec_chroot(&self, command: &str, as_root: bool) -> Result<bool, RootError> {
        let env = build_env(as_root, &host_env());
        let user = self.host_user();

        let mut chroot = Command::new("chroot");
        if !as_root {
            chroot
                .arg("--userspec")
                .arg(format!("{}:{}", user.uid, user.gid));
        }

        chroot
            .arg(self.path())
            .arg("/bin/bash")
            .arg("-lc")
            .arg(command)
            .env_clear()
            .envs(&env);

        debug!(command, as_root, "executing inside build root");

        let status = chroot.status().map_err(|e| RootError::Exec {
            command: command.to_string(),
            source: e,
        })?;

        Ok(status.success())
    }

    /// Runs a setup command as root inside the build root, requiring
    /// success.
    pub(crate) fn run_expecting_success(&self, command: &str) -> Result<(), RootError> {
        if self.run(command, true)? {
            Ok(())
        } else {
            Err(RootError::Setup {
                context: format!("command exited with failure: {command}"),
            })
        }
    }

    /// Creates the non-privileged account with the invoking user's numeric
    /// ids, so files created inside the root are owned correctly outside
    /// it.
    pub(crate) fn create_account(&self) -> Result<(), RootError> {
        let user = self.host_user();

        self.run_expecting_success(&format!(
            "/usr/sbin/groupadd {ACCOUNT_NAME} --gid {}",
            user.gid
        ))?;
        self.run_expecting_success(&format!(
            "/usr/sbin/useradd {ACCOUNT_NAME} --create-home --uid {} --gid {}",
            user.uid, user.gid
        ))
    }

    /// Writes minimal shell startup files for the root account and the
    /// non-privileged account, and prepares user-mount destinations.
    pub(crate) fn setup_accounts(&self) -> Result<(), RootError> {
        let user = self.host_user();

        write_file_in(
            self,
            "root/.bashrc",
            &format!("export LANG={ROOT_LOCALE}\n"),
        )?;

        let mut startup = format!("export LANG={ROOT_LOCALE}\n");
        if let Some(shell_path) = &self.config().shell_path {
            startup.push_str(&format!("cd {}\n", shell_path.display()));
        }

        let account_bashrc = format!("home/{ACCOUNT_NAME}/.bashrc");
        write_file_in(self, &account_bashrc, &startup)?;
        chown_in(self, &account_bashrc, user.uid, user.gid)?;

        for dest in self.config().user_mounts.values() {
            let relative = dest.strip_prefix("/").unwrap_or(dest);
            let full = self.path().join(relative);

            fs::create_dir_all(&full).map_err(|e| RootError::Io {
                context: format!("failed to create mount destination: {}", full.display()),
                source: e,
            })?;
            chown(&full, Some(user.uid), Some(user.gid)).map_err(|e| RootError::Io {
                context: format!("failed to chown mount destination: {}", full.display()),
                source: e,
            })?;
        }

        Ok(())
    }

    /// Grants the non-privileged account passwordless sudo.
    pub(crate) fn grant_sudo(&self) -> Result<(), RootError> {
        let sudoers_path = self.path().join("etc/sudoers");

        let conf = fs::read_to_string(&sudoers_path).map_err(|e| RootError::Io {
            context: format!("failed to read {}", sudoers_path.display()),
            source: e,
        })?;

        let line = format!("\n{ACCOUNT_NAME} ALL=(ALL:ALL) NOPASSWD:ALL");
        if !conf.contains(&line) {
            fs::write(&sudoers_path, format!("{conf}{line}")).map_err(|e| RootError::Io {
                context: format!("failed to write {}", sudoers_path.display()),
                source: e,
            })?;
        }

        Ok(())
    }

    /// Installs globally the configured npm packages, if any.
    pub(crate) fn install_npm_packages(&self) -> Result<(), RootError> {
        let packages = &self.config().npm_packages;
        if packages.is_empty() {
            return Ok(());
        }

        self.run_expecting_success(&format!("npm install -g {}", packages.join(" ")))
    }

    /// Installs the configured PyPI packages, if any.
    pub(crate) fn install_pypi_packages(&self) -> Result<(), RootError> {
        let packages = &self.config().pypi_packages;
        if packages.is_empty() {
            return Ok(());
        }

        self.run_expecting_success(&format!("pip install --upgrade {}", packages.join(" ")))
    }

    /// Best-effort copy of the host display cookie into the account's
    /// home, for interactive runs that talk to the host display server.
    fn setup_xauth(&self) {
        let Some(source) = std::env::var_os("XAUTHORITY") else {
            return;
        };

        let dest = self
            .path()
            .join("home")
            .join(ACCOUNT_NAME)
            .join(".Xauthority");
        let user = self.host_user();

        let copied = fs::copy(&source, &dest)
            .and_then(|_| chown(&dest, Some(user.uid), Some(user.gid)));

        if let Err(e) = copied {
            debug!(error = %e, "could not copy display cookie into build root");
        }
    }
}

/// Builds the execution environment for a run.
///
/// Pure function of the privilege level and a snapshot of host variables;
/// the ambient environment is read once by the caller, never mutated.
pub(crate) fn build_env(
    as_root: bool,
    host: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), ROOT_PATH_VAR.to_string());
    env.insert("LANG".to_string(), ROOT_LOCALE.to_string());
    env.insert(SANDBOX_MARKER.to_string(), "yes".to_string());

    let mut keep: Vec<&str> = KEEP_ALWAYS.to_vec();

    if as_root {
        env.insert("HOME".to_string(), "/root".to_string());
    } else {
        let home = format!("/home/{ACCOUNT_NAME}");
        env.insert("XAUTHORITY".to_string(), format!("{home}/.Xauthority"));
        env.insert("HOME".to_string(), home);
        keep.extend_from_slice(KEEP_INTERACTIVE);
    }

    for name in keep {
        if let Some(value) = host.get(name) {
            env.insert(name.to_string(), value.clone());
        }
    }

    env
}

fn host_env() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

fn write_file_in(root: &Root, relative: &str, content: &str) -> Result<(), RootError> {
    let full = root.path().join(relative);

    fs::write(&full, content).map_err(|e| RootError::Io {
        context: format!("failed to write {}", full.display()),
        source: e,
    })
}

fn chown_in(root: &Root, relative: &str, uid: u32, gid: u32) -> Result<(), RootError> {
    let full = root.path().join(relative);

    chown(&full, Some(uid), Some(gid)).map_err(|e| RootError::Io {
        context: format!("failed to chown {}", full.display()),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(vars: &[(&str, &str)]) -> BTreeMap<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_is_fully_explicit() {
        let host = host(&[("LD_PRELOAD", "/evil.so"), ("SHELL", "/bin/zsh")]);
        let env = build_env(true, &host);

        // Nothing outside the fixed set and the allow-list gets through.
        assert!(!env.contains_key("LD_PRELOAD"));
        assert!(!env.contains_key("SHELL"));
        assert_eq!(env["PATH"], "/bin:/usr/bin:/usr/sbin");
        assert_eq!(env["LANG"], "C");
    }

    #[test]
    fn test_env_marks_sandboxed_execution() {
        assert_eq!(build_env(true, &host(&[]))[SANDBOX_MARKER], "yes");
        assert_eq!(build_env(false, &host(&[]))[SANDBOX_MARKER], "yes");
    }

    #[test]
    fn test_env_home_per_privilege_level() {
        assert_eq!(build_env(true, &host(&[]))["HOME"], "/root");

        let env = build_env(false, &host(&[]));
        assert_eq!(env["HOME"], format!("/home/{ACCOUNT_NAME}"));
        assert_eq!(
            env["XAUTHORITY"],
            format!("/home/{ACCOUNT_NAME}/.Xauthority")
        );
    }

    #[test]
    fn test_env_forwards_proxies_at_both_levels() {
        let host = host(&[("http_proxy", "http://proxy:3128")]);

        assert_eq!(build_env(true, &host)["http_proxy"], "http://proxy:3128");
        assert_eq!(build_env(false, &host)["http_proxy"], "http://proxy:3128");
    }

    #[test]
    fn test_env_display_vars_only_for_interactive_runs() {
        let host = host(&[("DISPLAY", ":0"), ("TERM", "xterm-256color")]);

        let root_env = build_env(true, &host);
        assert!(!root_env.contains_key("DISPLAY"));
        assert!(!root_env.contains_key("TERM"));

        let user_env = build_env(false, &host);
        assert_eq!(user_env["DISPLAY"], ":0");
        assert_eq!(user_env["TERM"], "xterm-256color");
    }

    #[test]
    fn test_env_absent_host_vars_stay_absent() {
        let env = build_env(false, &host(&[]));
        assert!(!env.contains_key("DISPLAY"));
        assert!(!env.contains_key("http_proxy"));
    }
}
