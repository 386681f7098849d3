//! Debian build roots: debootstrap for the base image, apt for packages.

use std::path::Path;

use crate::error::RootError;
use crate::root::Root;

use super::{run_host_command, run_in_root, DistroAdapter};

/// Suite bootstrapped into new build roots.
const SUITE: &str = "bookworm";

#[derive(Debug, Clone, Copy, Default)]
pub struct DebianAdapter;

/// Assembles the debootstrap invocation.
fn bootstrap_args(
    suite: &str,
    path: &Path,
    arch: Option<&str>,
    mirror: Option<&str>,
) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(arch) = arch {
        args.push(format!("--arch={arch}"));
    }

    args.push(suite.to_string());
    args.push(path.display().to_string());

    if let Some(mirror) = mirror {
        args.push(mirror.to_string());
    }

    args
}

impl DistroAdapter for DebianAdapter {
    fn bootstrap(
        &self,
        root: &Root,
        arch: Option<&str>,
        mirror: Option<&str>,
    ) -> Result<(), RootError> {
        run_host_command("debootstrap", &bootstrap_args(SUITE, root.path(), arch, mirror))
    }

    fn update_packages(&self, root: &Root) -> Result<(), RootError> {
        run_in_root(root, "apt-get update")?;
        run_in_root(root, "apt-get -y dist-upgrade")
    }

    fn install_packages(&self, root: &Root, packages: &[String]) -> Result<(), RootError> {
        if packages.is_empty() {
            return Ok(());
        }

        run_in_root(
            root,
            &format!(
                "apt-get -y --no-install-recommends install {}",
                packages.join(" ")
            ),
        )
    }

    fn clean_packages(&self, root: &Root) -> Result<(), RootError> {
        run_in_root(root, "apt-get clean")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_args_minimal() {
        let args = bootstrap_args("bookworm", Path::new("/var/lib/rootbox/x-abcde"), None, None);
        assert_eq!(args, vec!["bookworm", "/var/lib/rootbox/x-abcde"]);
    }

    #[test]
    fn test_bootstrap_args_with_arch_and_mirror() {
        let args = bootstrap_args(
            "bookworm",
            Path::new("/var/lib/rootbox/x-abcde"),
            Some("i386"),
            Some("http://deb.example.org/debian"),
        );

        assert_eq!(
            args,
            vec![
                "--arch=i386",
                "bookworm",
                "/var/lib/rootbox/x-abcde",
                "http://deb.example.org/debian",
            ]
        );
    }
}
