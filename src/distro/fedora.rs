//! Fedora build roots: rpm for the initial database and release package,
//! yum for everything after.
//!
//! Bootstrap cannot run inside the root (there is nothing there yet), so
//! the release package is installed with the host's rpm against the new
//! root, the rpm database path and the repo files are pinned, and only
//! then does yum take over.

use std::fs;
use std::process::Command;

use tracing::debug;

use crate::error::RootError;
use crate::root::Root;

use super::{run_host_command, run_in_root, DistroAdapter};

/// Mirror used when the caller does not name one.
const DEFAULT_MIRROR: &str = "ftp://mirrors.kernel.org/fedora";

/// Fedora release bootstrapped into new build roots.
const RELEASE: &str = "19";

/// Release package installed to seed the root.
const RELEASE_RPM: &str = "fedora-release-19-2.noarch.rpm";

/// Static key location, replacing the per-mirror gpgkey entries.
const GPG_KEY_URL: &str = "http://fedoraproject.org/static/FB4B18E6.txt";

/// Repo files rewritten to pin the chosen mirror.
const REPO_NAMES: &[&str] = &["fedora", "fedora-updates", "fedora-updates-testing"];

#[derive(Debug, Clone, Copy, Default)]
pub struct FedoraAdapter;

fn release_rpm_url(mirror: &str) -> String {
    format!("{mirror}/releases/{RELEASE}/Fedora/x86_64/os/Packages/f/{RELEASE_RPM}")
}

/// Rewrites one yum repo file to pin the chosen mirror: baseurl uncommented
/// and pointed at the mirror, mirrorlist disabled, gpgkey made static.
fn rewrite_repo(conf: &str, mirror: &str) -> String {
    let mut out = String::with_capacity(conf.len());

    for line in conf.lines() {
        if let Some(rest) = line.strip_prefix("#baseurl") {
            out.push_str("baseurl");
            out.push_str(&rest.replace(
                "http://download.fedoraproject.org/pub/fedora/linux",
                mirror,
            ));
        } else if line.starts_with("mirrorlist") {
            out.push('#');
            out.push_str(line);
        } else if line.starts_with("gpgkey") {
            out.push_str("gpgkey=");
            out.push_str(GPG_KEY_URL);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    out
}

impl FedoraAdapter {
    /// Pins the rpm database path inside the root to the host's, so the
    /// host rpm and the chrooted yum agree on where the database lives.
    fn pin_rpm_db_path(&self, root: &Root) -> Result<(), RootError> {
        let output = Command::new("rpm")
            .args(["-E", "%_dbpath"])
            .output()
            .map_err(|e| RootError::Adapter {
                command: "rpm -E %_dbpath".to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(RootError::Adapter {
                command: "rpm -E %_dbpath".to_string(),
                detail: format!("exited with {}", output.status),
            });
        }

        let db_path = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let macros_path = root.path().join("root/.rpmmacros");
        fs::write(&macros_path, format!("%_dbpath {db_path}\n")).map_err(|e| RootError::Io {
            context: format!("failed to write {}", macros_path.display()),
            source: e,
        })
    }

    fn pin_repos(&self, root: &Root, mirror: &str) -> Result<(), RootError> {
        for name in REPO_NAMES {
            let repo_path = root.path().join(format!("etc/yum.repos.d/{name}.repo"));

            let conf = fs::read_to_string(&repo_path).map_err(|e| RootError::Io {
                context: format!("failed to read {}", repo_path.display()),
                source: e,
            })?;

            fs::write(&repo_path, rewrite_repo(&conf, mirror)).map_err(|e| RootError::Io {
                context: format!("failed to write {}", repo_path.display()),
                source: e,
            })?;
        }

        Ok(())
    }
}

impl DistroAdapter for FedoraAdapter {
    fn bootstrap(
        &self,
        root: &Root,
        arch: Option<&str>,
        mirror: Option<&str>,
    ) -> Result<(), RootError> {
        if arch.is_some() {
            debug!("fedora bootstrap follows the host architecture, --arch ignored");
        }

        let mirror = mirror.unwrap_or(DEFAULT_MIRROR);
        let path = root.path().display().to_string();

        run_host_command(
            "rpm",
            &["--root".to_string(), path.clone(), "--initdb".to_string()],
        )?;
        run_host_command(
            "rpm",
            &[
                "--root".to_string(),
                path.clone(),
                "-i".to_string(),
                release_rpm_url(mirror),
            ],
        )?;

        self.pin_rpm_db_path(root)?;
        self.pin_repos(root, mirror)?;

        run_host_command(
            "yum",
            &[
                "-y".to_string(),
                "--installroot".to_string(),
                path,
                "install".to_string(),
                "yum".to_string(),
            ],
        )
    }

    fn update_packages(&self, root: &Root) -> Result<(), RootError> {
        run_in_root(root, "yum -y update")
    }

    fn install_packages(&self, root: &Root, packages: &[String]) -> Result<(), RootError> {
        if packages.is_empty() {
            return Ok(());
        }

        run_in_root(root, &format!("yum -y install {}", packages.join(" ")))
    }

    fn clean_packages(&self, root: &Root) -> Result<(), RootError> {
        run_in_root(root, "yum clean all")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_rpm_url_uses_mirror() {
        let url = release_rpm_url("http://mirror.example.org/fedora");
        assert_eq!(
            url,
            "http://mirror.example.org/fedora/releases/19/Fedora/x86_64/os/Packages/f/fedora-release-19-2.noarch.rpm"
        );
    }

    #[test]
    fn test_rewrite_repo_pins_mirror() {
        let conf = "\
[fedora]
name=Fedora $releasever
#baseurl=http://download.fedoraproject.org/pub/fedora/linux/releases/$releasever/
mirrorlist=https://mirrors.fedoraproject.org/metalink?repo=fedora-$releasever
gpgkey=file:///etc/pki/rpm-gpg/RPM-GPG-KEY
";
        let rewritten = rewrite_repo(conf, "http://mirror.example.org/fedora");

        assert!(rewritten
            .contains("baseurl=http://mirror.example.org/fedora/releases/$releasever/"));
        assert!(rewritten.contains("#mirrorlist="));
        assert!(rewritten.contains(&format!("gpgkey={GPG_KEY_URL}")));
        assert!(!rewritten.contains("\n#baseurl"));
    }

    #[test]
    fn test_rewrite_repo_leaves_other_lines_alone() {
        let conf = "[fedora]\nname=Fedora\nenabled=1\n";
        assert_eq!(
            rewrite_repo(conf, "http://mirror.example.org"),
            "[fedora]\nname=Fedora\nenabled=1\n"
        );
    }
}
