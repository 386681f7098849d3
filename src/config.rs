//! Configuration document and build-root identity.
//!
//! The configuration is a JSON document loaded once per run. The build
//! root's on-disk location is derived from it deterministically: a hash of
//! the document's absolute path keeps roots built from different checkouts
//! of the same project from colliding, while the logical name keeps the
//! directory recognizable.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// Default directory under which build roots are stored.
pub const DEFAULT_VAR_DIR: &str = "/var/lib/rootbox";

/// Number of hash characters appended to the root directory name.
///
/// Five base64 characters bound the collision probability well below
/// anything reachable by a realistic number of checkouts while keeping the
/// directory name readable.
pub const PATH_HASH_LEN: usize = 5;

/// Supported distro adapters.
///
/// Selected at configuration-load time; all later dispatch goes through
/// [`DistroKind::adapter`](crate::distro), never through strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistroKind {
    Debian,
    Fedora,
}

/// Location of a prebuilt build-root image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrebuiltImage {
    /// Image name, as used in the remote "latest" pointer.
    pub name: String,
    /// Base URL the pointer and archives are resolved against.
    pub url: String,
}

/// The configuration document.
///
/// # Example
///
/// ```json
/// {
///     "name": "myproject",
///     "distro": "debian",
///     "packages": { "base": ["bash", "sudo"], "build": ["gcc", "make"] },
///     "user_mounts": { "./source": "home/rootbox/source" },
///     "shell_path": "/home/rootbox/source",
///     "stamp": "v1"
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    /// Logical name of the build root.
    pub name: String,

    /// Which distro adapter populates and updates the root.
    #[serde(default = "default_distro")]
    pub distro: DistroKind,

    /// Package groups: group name to package names. Group order is not
    /// significant; installation uses the deduplicated union.
    #[serde(default)]
    pub packages: BTreeMap<String, Vec<String>>,

    /// Extra host path to root-relative destination bind mounts.
    #[serde(default)]
    pub user_mounts: BTreeMap<PathBuf, PathBuf>,

    /// npm packages installed globally inside the root after OS packages.
    #[serde(default)]
    pub npm_packages: Vec<String>,

    /// PyPI packages installed inside the root after OS packages.
    #[serde(default)]
    pub pypi_packages: Vec<String>,

    /// Directory the non-root account's shell starts in.
    #[serde(default)]
    pub shell_path: Option<PathBuf>,

    /// Opaque configuration-version marker, compared against the stamp file.
    #[serde(default)]
    pub stamp: String,

    /// Prebuilt image location for fetch/distribute.
    #[serde(default)]
    pub prebuilt: Option<PrebuiltImage>,

    /// Absolute path the document was loaded from. Set by [`RootConfig::load`].
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_distro() -> DistroKind {
    DistroKind::Debian
}

impl RootConfig {
    /// Loads the configuration document from `path`.
    ///
    /// The path is made absolute first, since it feeds the root identity
    /// hash.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadFailed` if the file cannot be read, or
    /// `ConfigError::ParseFailed` if it is not a valid document.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let path = absolutize(path);

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::ReadFailed {
            path: path.clone(),
            source: e,
        })?;

        let mut config: RootConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseFailed {
                path: path.clone(),
                source: e,
            })?;

        config.config_path = path;
        Ok(config)
    }

    /// Computes the build root's on-disk path under `var_dir`.
    ///
    /// Pure function of the configuration: SHA-256 of the document's
    /// absolute path, base64-encoded with `+` and `/` replaced by `0`,
    /// truncated to [`PATH_HASH_LEN`] characters and appended to the
    /// logical name.
    #[must_use]
    pub fn compute_path(&self, var_dir: &Path) -> PathBuf {
        let digest = Sha256::digest(self.config_path.as_os_str().as_encoded_bytes());

        let encoded = base64::engine::general_purpose::STANDARD
            .encode(digest)
            .replace(['+', '/'], "0");

        var_dir.join(format!("{}-{}", self.name, &encoded[..PATH_HASH_LEN]))
    }

    /// Flattens the package groups into a deduplicated union.
    ///
    /// Groups are visited in sorted order so the result is stable across
    /// runs; within the union the first occurrence of a package wins.
    #[must_use]
    pub fn flattened_packages(&self) -> Vec<String> {
        let mut flat: Vec<String> = Vec::new();

        for group in self.packages.values() {
            for package in group {
                if !flat.contains(package) {
                    flat.push(package.clone());
                }
            }
        }

        flat
    }
}

/// Numeric ids of the invoking (non-root) user.
///
/// The tool runs as root via sudo; files created inside the build root must
/// end up owned by the real user, so the original ids are carried along
/// explicitly rather than read from ambient process state at use sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostUser {
    pub uid: u32,
    pub gid: u32,
}

impl HostUser {
    /// Resolves the invoking user from `SUDO_UID` and `SUDO_GID`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingInvokerId` or
    /// `ConfigError::InvalidInvokerId` when either variable is absent or
    /// not numeric.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            uid: read_id("SUDO_UID")?,
            gid: read_id("SUDO_GID")?,
        })
    }
}

fn read_id(variable: &'static str) -> Result<u32, ConfigError> {
    let value = env::var(variable).map_err(|_| ConfigError::MissingInvokerId { variable })?;

    value
        .parse()
        .map_err(|_| ConfigError::InvalidInvokerId { variable, value })
}

/// Makes `path` absolute against the current directory without touching the
/// filesystem.
pub(crate) fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_named(name: &str, config_path: &str) -> RootConfig {
        let mut config: RootConfig =
            serde_json::from_str(&format!(r#"{{ "name": "{name}" }}"#)).unwrap();
        config.config_path = PathBuf::from(config_path);
        config
    }

    #[test]
    fn test_parse_full_document() {
        let json = r#"{
            "name": "myproject",
            "distro": "fedora",
            "packages": { "base": ["bash"], "build": ["gcc", "make"] },
            "user_mounts": { "/home/me/src": "home/rootbox/src" },
            "npm_packages": ["grunt-cli"],
            "pypi_packages": ["flake8"],
            "shell_path": "/home/rootbox/src",
            "stamp": "v3",
            "prebuilt": { "name": "myproject", "url": "https://images.example.org/" }
        }"#;

        let config: RootConfig = serde_json::from_str(json).expect("failed to parse");

        assert_eq!(config.name, "myproject");
        assert_eq!(config.distro, DistroKind::Fedora);
        assert_eq!(config.packages["build"], vec!["gcc", "make"]);
        assert_eq!(
            config.user_mounts[&PathBuf::from("/home/me/src")],
            PathBuf::from("home/rootbox/src")
        );
        assert_eq!(config.npm_packages, vec!["grunt-cli"]);
        assert_eq!(config.pypi_packages, vec!["flake8"]);
        assert_eq!(config.shell_path, Some(PathBuf::from("/home/rootbox/src")));
        assert_eq!(config.stamp, "v3");
        assert_eq!(config.prebuilt.unwrap().name, "myproject");
    }

    #[test]
    fn test_parse_minimal_document() {
        let config: RootConfig = serde_json::from_str(r#"{ "name": "x" }"#).expect("parse failed");

        assert_eq!(config.name, "x");
        assert_eq!(config.distro, DistroKind::Debian);
        assert!(config.packages.is_empty());
        assert!(config.user_mounts.is_empty());
        assert_eq!(config.stamp, "");
        assert!(config.prebuilt.is_none());
    }

    #[test]
    fn test_compute_path_is_deterministic() {
        let var_dir = PathBuf::from("/var/lib/rootbox");
        let a = config_named("x", "/home/me/project/rootbox.json");
        let b = config_named("x", "/home/me/project/rootbox.json");

        assert_eq!(a.compute_path(&var_dir), b.compute_path(&var_dir));
    }

    #[test]
    fn test_compute_path_varies_with_name_and_location() {
        let var_dir = PathBuf::from("/var/lib/rootbox");
        let base = config_named("x", "/home/me/project/rootbox.json");
        let other_name = config_named("y", "/home/me/project/rootbox.json");
        let other_location = config_named("x", "/home/me/elsewhere/rootbox.json");

        assert_ne!(base.compute_path(&var_dir), other_name.compute_path(&var_dir));
        assert_ne!(
            base.compute_path(&var_dir),
            other_location.compute_path(&var_dir)
        );
    }

    #[test]
    fn test_compute_path_shape() {
        let config = config_named("proj", "/somewhere/rootbox.json");
        let path = config.compute_path(Path::new("/var/lib/rootbox"));

        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("proj-"));
        assert_eq!(file_name.len(), "proj-".len() + PATH_HASH_LEN);
        assert!(!file_name.contains('/'));
        assert!(!file_name.contains('+'));
        assert_eq!(path.parent().unwrap(), Path::new("/var/lib/rootbox"));
    }

    #[test]
    fn test_flattened_packages_deduplicates_across_groups() {
        let json = r#"{
            "name": "x",
            "packages": {
                "a": ["bash", "gcc"],
                "b": ["gcc", "make"],
                "c": ["bash"]
            }
        }"#;
        let config: RootConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.flattened_packages(), vec!["bash", "gcc", "make"]);
    }

    #[test]
    fn test_flattened_packages_stable_order() {
        // Groups are iterated in sorted key order, so the union does not
        // depend on the document's object ordering.
        let forward: RootConfig = serde_json::from_str(
            r#"{ "name": "x", "packages": { "a": ["one"], "b": ["two"] } }"#,
        )
        .unwrap();
        let reversed: RootConfig = serde_json::from_str(
            r#"{ "name": "x", "packages": { "b": ["two"], "a": ["one"] } }"#,
        )
        .unwrap();

        assert_eq!(forward.flattened_packages(), reversed.flattened_packages());
    }

    #[test]
    fn test_unknown_distro_rejected() {
        let result: std::result::Result<RootConfig, _> =
            serde_json::from_str(r#"{ "name": "x", "distro": "plan9" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_absolutize_keeps_absolute_paths() {
        assert_eq!(absolutize(Path::new("/etc/passwd")), PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn test_absolutize_anchors_relative_paths() {
        let abs = absolutize(Path::new("rootbox.json"));
        assert!(abs.is_absolute());
        assert!(abs.ends_with("rootbox.json"));
    }
}
