//! Distribution and fetch of prebuilt build-root images.
//!
//! A build root takes long to create from scratch, so a finished tree can
//! be archived (`distribute`) and re-created elsewhere by download and
//! extraction (`fetch`). The wrinkle is identity: the root's directory name
//! embeds a hash of the producing host's configuration path, so an archive
//! never extracts verbatim. Entry paths are remapped onto the locally
//! computed root path instead.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, instrument};

use crate::config::PATH_HASH_LEN;
use crate::error::{Result, RootError, TransferError};
use crate::root::{RemoveDirOnDrop, Root};

/// Removes a scratch file on drop, success or failure.
struct RemoveFileOnDrop<'a> {
    path: &'a Path,
}

impl Drop for RemoveFileOnDrop<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path);
    }
}

impl Root {
    /// Archives the build root into `<name>-rootbox.tar.gz` in the current
    /// directory and returns the archive path.
    ///
    /// # Errors
    ///
    /// Returns `RootError::NotFound` if the root does not exist, or a
    /// `TransferError` if archiving fails.
    #[instrument(skip(self), fields(path = %self.path().display()))]
    pub fn distribute(&self) -> Result<PathBuf> {
        self.require_exists()?;

        let archive_path = PathBuf::from(format!("{}-rootbox.tar.gz", self.config().name));
        self.write_archive(&archive_path)?;

        info!(archive = %archive_path.display(), "build root archived");
        Ok(archive_path)
    }

    /// Streams the root tree into a tar.gz archive at `dest`.
    ///
    /// Entries carry the root path stripped of its leading slash, so fetch
    /// on another host can recognize the image directory and remap it.
    fn write_archive(&self, dest: &Path) -> std::result::Result<(), TransferError> {
        let file = File::create(dest).map_err(|e| TransferError::Archive {
            context: format!("failed to create {}", dest.display()),
            source: e,
        })?;

        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let prefix = self.path().strip_prefix("/").unwrap_or(self.path());
        builder
            .append_dir_all(prefix, self.path())
            .map_err(|e| TransferError::Archive {
                context: format!("failed to archive {}", self.path().display()),
                source: e,
            })?;

        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map(drop)
            .map_err(|e| TransferError::Archive {
                context: format!("failed to finish {}", dest.display()),
                source: e,
            })
    }

    /// Downloads and extracts the latest prebuilt image for this
    /// configuration, then stamps the root.
    ///
    /// The remote "latest" pointer at `<url>last-<arch>-<name>` names the
    /// archive to download. The archive lands in a scratch file that is
    /// removed on success or failure; the partially-extracted tree is
    /// removed on failure; the stamp is written only after extraction fully
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Returns `RootError::AlreadyExists` if the root is present,
    /// `TransferError::NoPrebuilt` if the configuration names no image, or
    /// a `TransferError` for network and extraction failures.
    #[instrument(skip(self), fields(path = %self.path().display()))]
    pub fn fetch(&self) -> Result<()> {
        if self.exists() {
            return Err(RootError::AlreadyExists {
                path: self.path().to_path_buf(),
            }
            .into());
        }

        let prebuilt = self
            .config()
            .prebuilt
            .as_ref()
            .ok_or(TransferError::NoPrebuilt)?;

        let archive_name = resolve_latest(&prebuilt.url, &prebuilt.name)?;

        fs::create_dir_all(self.var_dir()).map_err(|e| TransferError::Io {
            context: format!("failed to create {}", self.var_dir().display()),
            source: e,
        })?;

        let scratch_path = self.var_dir().join(&archive_name);
        let _scratch = RemoveFileOnDrop {
            path: &scratch_path,
        };

        download(&format!("{}{}", prebuilt.url, archive_name), &scratch_path)?;

        fs::create_dir_all(self.path()).map_err(|e| TransferError::Io {
            context: format!("failed to create {}", self.path().display()),
            source: e,
        })?;
        let rollback = RemoveDirOnDrop::new(self.path());

        self.extract_archive(&scratch_path)?;

        self.write_stamp()?;
        rollback.disarm();

        info!(path = %self.path().display(), "prebuilt build root fetched");
        Ok(())
    }

    /// Extracts a downloaded archive into the root path, remapping the
    /// archived image directory onto the local one.
    fn extract_archive(&self, archive_path: &Path) -> std::result::Result<(), TransferError> {
        let file = File::open(archive_path).map_err(|e| TransferError::Io {
            context: format!("failed to open {}", archive_path.display()),
            source: e,
        })?;

        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        // Numeric ownership can only be restored by root; in that case the
        // archive's ids are taken verbatim.
        archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());

        let entries = archive.entries().map_err(|e| TransferError::Io {
            context: format!("failed to read {}", archive_path.display()),
            source: e,
        })?;

        for entry in entries {
            let mut entry = entry.map_err(|e| TransferError::Io {
                context: "failed to read archive entry".to_string(),
                source: e,
            })?;

            let entry_path = entry
                .path()
                .map_err(|e| TransferError::Io {
                    context: "archive entry has an unreadable path".to_string(),
                    source: e,
                })?
                .into_owned();

            let Some(relative) = remap_entry_path(&entry_path, &self.config().name) else {
                debug!(entry = %entry_path.display(), "entry outside the image tree, skipping");
                continue;
            };

            if relative.as_os_str().is_empty() {
                // The image directory itself; already created.
                continue;
            }

            if relative.components().any(|c| c == Component::ParentDir) {
                return Err(TransferError::Extract {
                    context: format!("entry escapes the image tree: {}", entry_path.display()),
                });
            }

            let dest = self.path().join(&relative);

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| TransferError::Io {
                    context: format!("failed to create {}", parent.display()),
                    source: e,
                })?;
            }

            entry.unpack(&dest).map_err(|_| TransferError::Extract {
                context: format!("failed to unpack {}", entry_path.display()),
            })?;
        }

        Ok(())
    }
}

/// Resolves the remote "latest" pointer to an archive file name.
fn resolve_latest(base_url: &str, name: &str) -> std::result::Result<String, TransferError> {
    let url = format!("{}last-{}-{}", base_url, host_arch(), name);
    debug!(%url, "resolving latest prebuilt image");

    let body = reqwest::blocking::get(&url)
        .and_then(reqwest::blocking::Response::error_for_status)
        .and_then(|response| response.text())
        .map_err(|e| TransferError::Download {
            url: url.clone(),
            source: e,
        })?;

    // Keep only the file name; the pointer is remote input and must not
    // steer the scratch path out of the storage directory.
    Path::new(body.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .map(ToString::to_string)
        .ok_or(TransferError::Extract {
            context: format!("latest pointer at {url} is empty"),
        })
}

/// Downloads `url` into `dest`, streaming.
fn download(url: &str, dest: &Path) -> std::result::Result<(), TransferError> {
    debug!(%url, dest = %dest.display(), "downloading archive");

    let mut response = reqwest::blocking::get(url)
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(|e| TransferError::Download {
            url: url.to_string(),
            source: e,
        })?;

    let mut file = File::create(dest).map_err(|e| TransferError::Io {
        context: format!("failed to create scratch file: {}", dest.display()),
        source: e,
    })?;

    io::copy(&mut response, &mut file).map_err(|e| TransferError::Io {
        context: format!("failed to write scratch file: {}", dest.display()),
        source: e,
    })?;

    Ok(())
}

/// Strips everything up to and including the archived image directory
/// (`<name>-<hash>`), returning the path below it.
///
/// The archive was produced on a host whose path hash differs, so the
/// prefix cannot be compared literally; the image directory is recognized
/// by shape instead. Returns `None` for entries outside any image
/// directory.
fn remap_entry_path(entry_path: &Path, name: &str) -> Option<PathBuf> {
    let mut components = entry_path.components();

    for component in components.by_ref() {
        let Component::Normal(part) = component else {
            continue;
        };

        if part.to_str().is_some_and(|part| is_image_dir(part, name)) {
            return Some(components.as_path().to_path_buf());
        }
    }

    None
}

fn is_image_dir(component: &str, name: &str) -> bool {
    component
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|hash| {
            hash.len() == PATH_HASH_LEN && hash.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

fn host_arch() -> String {
    let machine = nix::sys::utsname::uname()
        .map(|info| info.machine().to_string_lossy().into_owned())
        .unwrap_or_else(|_| std::env::consts::ARCH.to_string());

    normalize_arch(&machine)
}

/// 32-bit x86 hosts report finer-grained machine names than the archive
/// naming scheme uses.
fn normalize_arch(machine: &str) -> String {
    match machine {
        "i686" => "i386".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostUser, RootConfig};

    fn root_in(var_dir: &Path, config_path: &str) -> Root {
        let mut config: RootConfig = serde_json::from_str(r#"{ "name": "x" }"#).unwrap();
        config.config_path = PathBuf::from(config_path);

        Root::new(config, HostUser { uid: 1000, gid: 1000 }).with_var_dir(var_dir)
    }

    #[test]
    fn test_remap_recognizes_image_dir_with_any_hash() {
        let remapped = remap_entry_path(
            Path::new("var/lib/rootbox/x-Zz9Aa/etc/hostname"),
            "x",
        );
        assert_eq!(remapped, Some(PathBuf::from("etc/hostname")));
    }

    #[test]
    fn test_remap_of_image_dir_itself_is_empty() {
        let remapped = remap_entry_path(Path::new("var/lib/rootbox/x-Zz9Aa"), "x");
        assert_eq!(remapped, Some(PathBuf::new()));
    }

    #[test]
    fn test_remap_rejects_foreign_entries() {
        assert_eq!(remap_entry_path(Path::new("var/lib/other/tree/etc"), "x"), None);
        // Wrong hash length is not an image directory.
        assert_eq!(
            remap_entry_path(Path::new("var/lib/rootbox/x-toolong/etc"), "x"),
            None
        );
        // Name must match exactly up to the separator.
        assert_eq!(
            remap_entry_path(Path::new("var/lib/rootbox/xy-Zz9Aa/etc"), "x"),
            None
        );
    }

    #[test]
    fn test_normalize_arch() {
        assert_eq!(normalize_arch("i686"), "i386");
        assert_eq!(normalize_arch("x86_64"), "x86_64");
        assert_eq!(normalize_arch("aarch64"), "aarch64");
    }

    #[test]
    fn test_archive_roundtrip_remaps_prefix() {
        let producer_dir = tempfile::tempdir().expect("failed to create tempdir");
        let consumer_dir = tempfile::tempdir().expect("failed to create tempdir");

        // Producer: same logical name, different config location, so the
        // two roots get different path hashes.
        let producer = root_in(producer_dir.path(), "/home/producer/rootbox.json");
        let consumer = root_in(consumer_dir.path(), "/home/consumer/rootbox.json");
        assert_ne!(
            producer.path().file_name(),
            consumer.path().file_name(),
            "test requires differing hashes"
        );

        fs::create_dir_all(producer.path().join("etc")).unwrap();
        fs::write(producer.path().join("etc/hostname"), "built-elsewhere\n").unwrap();
        fs::create_dir_all(producer.path().join("usr/bin")).unwrap();
        fs::write(producer.path().join("usr/bin/tool"), "#!/bin/sh\n").unwrap();

        let archive_path = producer_dir.path().join("image.tar.gz");
        producer
            .write_archive(&archive_path)
            .expect("failed to archive");

        fs::create_dir_all(consumer.path()).unwrap();
        consumer
            .extract_archive(&archive_path)
            .expect("failed to extract");

        let hostname = fs::read_to_string(consumer.path().join("etc/hostname")).unwrap();
        assert_eq!(hostname, "built-elsewhere\n");
        assert!(consumer.path().join("usr/bin/tool").exists());
    }
}
