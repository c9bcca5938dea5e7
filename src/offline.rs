//! Attaches a file-backed update image as a virtual block device and
//! presents it to the package tool as a file-based repository.
//!
//! The attach handle is shared with the daemon's shutdown path so an
//! interrupted session still releases the device.

use crate::misc;
use as_result::{IntoResult, MapResult};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("offline update file {path:?} does not exist")]
    Missing { path: PathBuf },

    #[error("failed to attach a memory disk for {path:?}")]
    Attach {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("memory disk attach returned no device name")]
    NoDevice,

    #[error("failed to create image mount directory {dir:?}")]
    MountDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("offline update file {path:?} cannot be mounted")]
    Mount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create repository directory {dir:?}")]
    RepoDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write repository descriptor {path:?}")]
    RepoWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
struct Attached {
    device: String,
    mountpoint: PathBuf,
}

/// Process-wide handle on the attached update image. Attach happens at most
/// once per session; detach is a no-op unless something is attached.
#[derive(Clone, Debug, Default)]
pub struct OfflineImage {
    state: Arc<Mutex<Option<Attached>>>,
}

impl OfflineImage {
    pub fn attached(&self) -> bool { self.state_lock().is_some() }

    /// Attaches and mounts the image read-only. Calling this twice is a
    /// no-op; a later `detach` makes the handle fresh again.
    pub async fn mount(&self, file: &Path, mountpoint: &Path) -> Result<(), OfflineError> {
        if self.attached() {
            info!("offline image already attached, reusing it");
            return Ok(());
        }

        if !file.exists() {
            return Err(OfflineError::Missing { path: file.to_owned() });
        }

        info!("attaching offline update image {:?}", file);

        let output = cascade! {
            Command::new("mdconfig");
            ..args(&["-a", "-t", "vnode", "-f"]);
            ..arg(file);
        }
        .output()
        .await
        .and_then(|output| output.status.into_result().map(|_| output))
        .map_err(|source| OfflineError::Attach { path: file.to_owned(), source })?;

        let device = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if device.is_empty() {
            return Err(OfflineError::NoDevice);
        }

        fs::create_dir_all(mountpoint)
            .map_err(|source| OfflineError::MountDir { dir: mountpoint.to_owned(), source })?;

        // Sweep a stale mount left by an earlier crashed session.
        let _ = Command::new("umount").arg("-f").arg(mountpoint).status().await;

        let mounted = Command::new("mount")
            .args(&["-o", "ro"])
            .arg(format!("/dev/{}", device))
            .arg(mountpoint)
            .status()
            .await
            .map_result();

        if let Err(source) = mounted {
            // Never leave an orphaned device behind a failed mount.
            let _ = Command::new("mdconfig").args(&["-d", "-u", device.as_str()]).status().await;
            return Err(OfflineError::Mount { path: file.to_owned(), source });
        }

        info!("offline image mounted on {:?} via {}", mountpoint, device);
        *self.state_lock() = Some(Attached { device, mountpoint: mountpoint.to_owned() });

        Ok(())
    }

    /// Unmounts and detaches the device. No-op when nothing is attached, so
    /// it is safe to call from every cleanup path.
    pub async fn detach(&self) {
        let attached = self.state_lock().take();

        if let Some(Attached { device, mountpoint }) = attached {
            info!("detaching offline image device {}", device);
            let _ = Command::new("umount").arg("-f").arg(&mountpoint).status().await;
            let _ = Command::new("mdconfig").args(&["-d", "-u", device.as_str()]).status().await;
        }
    }

    fn state_lock(&self) -> MutexGuard<Option<Attached>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Writes the repository descriptor pointing at the mounted image and
/// returns the `REPOS_DIR` fragment to append to the package tool
/// configuration. `db_root` is the database path as seen by the package
/// tool; `prefix` re-roots the written file into a staged environment.
pub fn synthesize_repo(
    prefix: &Path,
    db_root: &Path,
    mountpoint: &Path,
    key: &str,
) -> Result<String, OfflineError> {
    let repos_dir = misc::prefixed(prefix, db_root).join("repos");

    fs::create_dir_all(&repos_dir)
        .map_err(|source| OfflineError::RepoDir { dir: repos_dir.clone(), source })?;

    let mut descriptor = format!("Update: {{\n  url: \"file://{}\",\n", mountpoint.display());

    if key.is_empty() {
        descriptor.push_str("  signature_type: \"none\",\n");
    } else {
        descriptor.push_str("  signature_type: \"pubkey\",\n");
        descriptor.push_str(&format!("  pubkey: \"{}\",\n", key));
    }

    descriptor.push_str("  enabled: yes\n}\n");

    let path = repos_dir.join("repo.conf");
    fs::write(&path, descriptor).map_err(|source| OfflineError::RepoWrite { path, source })?;

    Ok(format!("REPOS_DIR: [ \"{}/repos\", ]", db_root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_mount_is_a_noop() {
        let image = OfflineImage::default();
        *image.state_lock() = Some(Attached {
            device: "md0".into(),
            mountpoint: PathBuf::from("/var/db/snapup/mnt"),
        });

        // The path does not exist; an attach attempt would fail, so success
        // proves the call short-circuited on the existing attachment.
        image
            .mount(Path::new("/nonexistent/update.img"), Path::new("/var/db/snapup/mnt"))
            .await
            .unwrap();

        assert!(image.attached());
    }

    #[tokio::test]
    async fn detach_without_mount_is_a_noop() {
        let image = OfflineImage::default();
        image.detach().await;
        assert!(!image.attached());
    }

    #[tokio::test]
    async fn missing_image_is_rejected() {
        let image = OfflineImage::default();
        let result = image
            .mount(Path::new("/nonexistent/update.img"), Path::new("/var/db/snapup/mnt"))
            .await;

        assert!(matches!(result, Err(OfflineError::Missing { .. })));
    }

    #[test]
    fn repo_descriptor_unsigned() {
        let tmp = tempfile::tempdir().unwrap();
        let fragment = synthesize_repo(
            tmp.path(),
            Path::new("/var/db/pkg"),
            Path::new("/var/db/snapup/mnt"),
            "",
        )
        .unwrap();

        assert_eq!(fragment, "REPOS_DIR: [ \"/var/db/pkg/repos\", ]");

        let written =
            fs::read_to_string(tmp.path().join("var/db/pkg/repos/repo.conf")).unwrap();
        assert!(written.contains("url: \"file:///var/db/snapup/mnt\""));
        assert!(written.contains("signature_type: \"none\""));
        assert!(!written.contains("pubkey"));
    }

    #[test]
    fn repo_descriptor_signed() {
        let tmp = tempfile::tempdir().unwrap();
        synthesize_repo(
            tmp.path(),
            Path::new("/var/db/pkg"),
            Path::new("/var/db/snapup/mnt"),
            "/usr/local/share/keys/update.pub",
        )
        .unwrap();

        let written =
            fs::read_to_string(tmp.path().join("var/db/pkg/repos/repo.conf")).unwrap();
        assert!(written.contains("signature_type: \"pubkey\""));
        assert!(written.contains("pubkey: \"/usr/local/share/keys/update.pub\""));
    }
}
