//! Lifecycle of the staging boot environment.
//!
//! Everything stage 1 mutates lives inside a disposable clone of the root
//! filesystem. The previously-active environment is captured before any
//! mutation and is never renamed or destroyed; it stays the fallback boot
//! target until stage 2 has verified the new environment.

pub mod state;

use crate::{
    events::Reporter,
    misc,
    offline::{self, OfflineError},
    pkgdb,
    session::Session,
    BE_BIN, BE_STAGE, STAGE_DIR, VERSION_MARKER,
};
use as_result::{IntoResult, MapResult};
use std::{
    fs::{self, OpenOptions},
    io,
    path::Path,
};
use thiserror::Error;
use tokio::process::Command;

pub type BeResult<T> = Result<T, BeError>;

#[derive(Debug, Error)]
pub enum BeError {
    #[error("failed to create the staging boot environment")]
    Create(#[source] io::Error),

    #[error("failed to mount the staging boot environment")]
    Mount(#[source] io::Error),

    #[error("failed to mount devfs inside the stage")]
    Devfs(#[source] io::Error),

    #[error("failed to create the staged cache directory")]
    CacheDir(#[source] io::Error),

    #[error("failed to bind the package cache into the stage")]
    CacheMount(#[source] io::Error),

    #[error("failed to clear the staged package database")]
    ScrubDb(#[source] io::Error),

    #[error("failed to refresh the staged /etc/pkg configuration")]
    EtcPkg(#[source] io::Error),

    #[error("failed to copy the package database into the stage")]
    CopyDb(#[source] io::Error),

    #[error("failed to refresh the staged resolv.conf")]
    Resolv(#[source] io::Error),

    #[error("failed to write the staged package tool configuration")]
    StagedConf(#[source] io::Error),

    #[error("failed to bind the offline image into the stage")]
    ImageBind(#[source] io::Error),

    #[error("boot environment {name} already exists")]
    NameTaken { name: String },

    #[error("failed to list boot environments")]
    List(#[source] io::Error),

    #[error("failed to determine the active boot environment")]
    ActiveBe(#[source] anyhow::Error),

    #[error("failed to create the loader configuration placeholder")]
    LoaderConf(#[source] io::Error),

    #[error("failed to unmount the staging boot environment")]
    Unmount(#[source] io::Error),

    #[error("failed to rename the staging boot environment to {name}")]
    Rename {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to activate boot environment {name}")]
    Activate {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Persist(#[from] state::StateError),

    #[error(transparent)]
    Offline(#[from] OfflineError),
}

/// Builds a fresh staging environment carrying the live system's package
/// configuration and the session's mirrored database. Any stale stage left
/// by a previous failed run is destroyed first.
pub async fn create_stage(session: &Session, reporter: &Reporter) -> BeResult<()> {
    destroy_stage().await;

    reporter.info("Creating new boot environment");

    run(be_cmd().args(&["create", BE_STAGE])).await.map_err(BeError::Create)?;
    run(be_cmd().args(&["mount", BE_STAGE, STAGE_DIR])).await.map_err(BeError::Mount)?;

    let stage = Path::new(STAGE_DIR);

    run(Command::new("mount").args(&["-t", "devfs", "devfs"]).arg(stage.join("dev")))
        .await
        .map_err(BeError::Devfs)?;

    let staged_cache = misc::prefixed(stage, &session.layout.cache_dir);
    fs::create_dir_all(&staged_cache).map_err(BeError::CacheDir)?;

    run(&mut cascade! {
        Command::new("mount");
        ..args(&["-t", "nullfs"]);
        ..arg(&session.layout.cache_dir);
        ..arg(&staged_cache);
    })
    .await
    .map_err(BeError::CacheMount)?;

    // Replace whatever package state the snapshot carried with the session's
    // negotiated view of the live system.
    let staged_db = misc::prefixed(stage, "/var/db/pkg");
    remove_tree(&staged_db).map_err(BeError::ScrubDb)?;

    let staged_etc = misc::prefixed(stage, "/etc/pkg");
    remove_tree(&staged_etc).map_err(BeError::EtcPkg)?;
    run(Command::new("cp").arg("-r").arg("/etc/pkg").arg(&staged_etc))
        .await
        .map_err(BeError::EtcPkg)?;

    run(&mut cascade! {
        Command::new("cp");
        ..arg("-r");
        ..arg(&session.layout.pkg_db);
        ..arg(&staged_db);
    })
    .await
    .map_err(BeError::CopyDb)?;

    // The stage resolves repository hosts during the upgrade.
    misc::cp(Path::new("/etc/resolv.conf"), &misc::prefixed(stage, "/etc/resolv.conf"))
        .await
        .map_err(BeError::Resolv)?;

    let staged_repos = match session.request.offline_image() {
        Some(_) => Some(offline::synthesize_repo(
            stage,
            Path::new("/var/db/pkg"),
            &session.layout.img_mnt,
            &session.request.updatekey,
        )?),
        None => None,
    };

    let staged_conf = misc::prefixed(stage, &session.layout.pkg_conf);
    if let Some(parent) = staged_conf.parent() {
        fs::create_dir_all(parent).map_err(BeError::StagedConf)?;
    }

    fs::write(&staged_conf, pkgdb::render_staged_conf(session, staged_repos.as_deref()))
        .map_err(BeError::StagedConf)?;

    info!("staging boot environment assembled at {}", STAGE_DIR);
    Ok(())
}

/// Binds the mounted offline image to the same path inside the stage, so
/// the file-based repository URL resolves after the chroot.
pub async fn bind_image_mount(session: &Session) -> BeResult<()> {
    if session.request.offline_image().is_none() {
        return Ok(());
    }

    let target = misc::prefixed(Path::new(STAGE_DIR), &session.layout.img_mnt);
    fs::create_dir_all(&target).map_err(BeError::ImageBind)?;

    run(&mut cascade! {
        Command::new("mount");
        ..args(&["-t", "nullfs"]);
        ..arg(&session.layout.img_mnt);
        ..arg(&target);
    })
    .await
    .map_err(BeError::ImageBind)
}

/// Drops the image bind again; failure only costs a stale mount in a
/// disposable environment, so it is reported rather than returned.
pub async fn unbind_image_mount(session: &Session, prefix: &Path) {
    if session.request.offline_image().is_none() {
        return;
    }

    let target = misc::prefixed(prefix, &session.layout.img_mnt);
    if let Err(why) = run(Command::new("umount").arg("-f").arg(&target)).await {
        warn!("failed to unmount {:?}: {}", target, why);
    }
}

/// Seals the stage: persists the hand-off names, releases every mount and
/// renames/activates the finished environment. This is the highest-risk
/// window of the whole session; each step is ordered so that a failure
/// before `activate` leaves the previous environment bootable.
pub async fn rename_and_activate(session: &Session, reporter: &Reporter) -> BeResult<String> {
    let stage = Path::new(STAGE_DIR);
    let name = final_name(&session.request.bename, stage);

    if name != BE_STAGE && exists(&name).await? {
        return Err(BeError::NameTaken { name });
    }

    let previous = active_be().await?;
    state::StageHandoff { new_be: name.clone(), previous_be: previous }.write_to(stage)?;

    // The BE tool refuses to activate an environment without a loader
    // configuration file.
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(stage.join("boot/loader.conf"))
        .map_err(BeError::LoaderConf)?;

    let _ = run(Command::new("umount").arg("-f").arg(stage.join("dev"))).await;
    let _ = run(Command::new("umount")
        .arg("-f")
        .arg(misc::prefixed(stage, &session.layout.cache_dir)))
    .await;

    run(be_cmd().args(&["umount", "-f", BE_STAGE])).await.map_err(BeError::Unmount)?;

    if name != BE_STAGE {
        run(be_cmd().args(&["rename", BE_STAGE, name.as_str()]))
            .await
            .map_err(|source| BeError::Rename { name: name.clone(), source })?;
    }

    reporter.info(fomat!("Activating boot environment " (name)));
    activate(&name).await?;

    Ok(name)
}

/// Makes `name` the default boot target.
pub async fn activate(name: &str) -> BeResult<()> {
    run(be_cmd().args(&["activate", name]))
        .await
        .map_err(|source| BeError::Activate { name: name.to_owned(), source })
}

/// Force-unmounts and destroys the staging environment. Used both for
/// pre-flight cleanup and for abandoning a failed session, so every step is
/// best-effort.
pub async fn destroy_stage() {
    let _ = run(Command::new("umount").arg("-f").arg(Path::new(STAGE_DIR).join("dev"))).await;
    let _ = run(Command::new("umount").args(&["-f", STAGE_DIR])).await;
    let _ = run(be_cmd().args(&["destroy", "-F", BE_STAGE])).await;
}

pub async fn exists(name: &str) -> BeResult<bool> {
    let output = be_cmd().args(&["list", "-H"]).output().await.map_err(BeError::List)?;
    output.status.into_result().map_err(BeError::List)?;

    Ok(list_contains(&String::from_utf8_lossy(&output.stdout), name))
}

/// Name of the currently booted environment, parsed from the root mount.
pub async fn active_be() -> BeResult<String> {
    let dataset = root_dataset_of_mounts().await?;

    dataset_be(&dataset)
        .map(String::from)
        .ok_or_else(|| BeError::ActiveBe(anyhow!("root dataset {} has no environment part", dataset)))
}

/// Pool backing the currently booted environment.
pub async fn active_pool() -> BeResult<String> {
    let dataset = root_dataset_of_mounts().await?;

    dataset_pool(&dataset)
        .map(String::from)
        .ok_or_else(|| BeError::ActiveBe(anyhow!("root dataset {} has no pool part", dataset)))
}

async fn root_dataset_of_mounts() -> BeResult<String> {
    let output = Command::new("mount")
        .output()
        .await
        .map_err(|why| BeError::ActiveBe(why.into()))?;

    root_dataset(&String::from_utf8_lossy(&output.stdout))
        .map(String::from)
        .ok_or_else(|| BeError::ActiveBe(anyhow!("no device mounted on /")))
}

fn be_cmd() -> Command { Command::new(BE_BIN) }

async fn run(cmd: &mut Command) -> io::Result<()> {
    cmd.status().await.map_result()
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(why) if why.kind() != io::ErrorKind::NotFound => Err(why),
        _ => Ok(()),
    }
}

/// Picks the final name: the explicit override, else the staged version
/// marker, else a timestamp.
fn final_name(explicit: &str, stage: &Path) -> String {
    if !explicit.is_empty() {
        return explicit.to_owned();
    }

    version_marker(stage).unwrap_or_else(timestamp_name)
}

fn version_marker(root: &Path) -> Option<String> {
    let marker = fs::read_to_string(root.join(VERSION_MARKER)).ok()?;
    marker.split_whitespace().next().map(String::from)
}

fn timestamp_name() -> String {
    chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string()
}

fn list_contains(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|entry| entry == name)
}

fn root_dataset(mount_output: &str) -> Option<&str> {
    mount_output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;

        if fields.next()? == "on" && fields.next()? == "/" {
            Some(device)
        } else {
            None
        }
    })
}

fn dataset_be(dataset: &str) -> Option<&str> {
    dataset.split('/').nth(2).filter(|part| !part.is_empty())
}

fn dataset_pool(dataset: &str) -> Option<&str> {
    dataset.split('/').next().filter(|part| !part.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "zroot/ROOT/default on / (zfs, local, noatime, nfsv4acls)
devfs on /dev (devfs)
zroot/usr/home on /usr/home (zfs, local, noatime, nfsv4acls)
";

    #[test]
    fn root_dataset_from_mounts() {
        assert_eq!(root_dataset(MOUNTS), Some("zroot/ROOT/default"));
        assert_eq!(root_dataset("tmpfs on /tmp (tmpfs)"), None);
    }

    #[test]
    fn dataset_components() {
        assert_eq!(dataset_be("zroot/ROOT/default"), Some("default"));
        assert_eq!(dataset_pool("zroot/ROOT/default"), Some("zroot"));
        assert_eq!(dataset_be("zroot"), None);
    }

    #[test]
    fn listing_lookup() {
        let listing = "default\t-\t-\t2.1G\t2021-05-12 09:01
13.1-RELEASE\tNR\t/\t8.4G\t2022-06-02 11:15
";
        assert!(list_contains(listing, "default"));
        assert!(list_contains(listing, "13.1-RELEASE"));
        assert!(!list_contains(listing, "13.1"));
    }

    #[test]
    fn final_name_priority() {
        let stage = tempfile::tempdir().unwrap();

        // No marker: explicit override wins, then the timestamp fallback.
        assert_eq!(final_name("custom", stage.path()), "custom");

        let fallback = final_name("", stage.path());
        assert_eq!(fallback.len(), "2022-06-02-11-15-00".len());

        fs::create_dir_all(stage.path().join("etc")).unwrap();
        fs::write(stage.path().join(VERSION_MARKER), "13.1-RELEASE amd64\n").unwrap();

        assert_eq!(final_name("", stage.path()), "13.1-RELEASE");
        assert_eq!(final_name("custom", stage.path()), "custom");
    }
}
