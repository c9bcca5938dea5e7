//! Rewrites boot code on every disk backing the active pool, so the next
//! boot loads the staged environment's loader.
//!
//! Disks are discovered by cross-referencing the kernel's disk list against
//! the pool status, matching either the device name or its partition
//! rawuuids. Each disk is then classified by its partition table: an EFI
//! system partition gets the staged `loader.efi`, a freebsd-boot partition
//! gets fresh `pmbr` + `gptzfsboot` boot code.

use crate::{be, events::Reporter, misc};
use as_result::{IntoResult, MapResult};
use std::{fs, io, path::Path};
use sys_mount::{Mount, Unmount, UnmountFlags};
use thiserror::Error;
use tokio::process::Command;

pub type BootResult<T> = Result<T, BootloaderError>;

#[derive(Debug, Error)]
pub enum BootloaderError {
    #[error("failed to read the kernel disk list")]
    Disks(#[source] io::Error),

    #[error("failed to query status of pool {pool}")]
    PoolStatus {
        pool: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to inspect the partition table of {disk}")]
    Gpart {
        disk: String,
        #[source]
        source: io::Error,
    },

    #[error("{disk} carries neither an EFI nor a boot partition")]
    Unclassified { disk: String },

    #[error("no EFI system partition found on {disk}")]
    NoEfiPartition { disk: String },

    #[error("no boot partition found on {disk}")]
    NoBootPartition { disk: String },

    #[error("failed to prepare a scratch mount point for the EFI partition")]
    EfiScratch(#[source] io::Error),

    #[error("failed to mount the EFI system partition {device}")]
    EfiMount {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to install the EFI loader at {target:?}")]
    EfiInstall {
        target: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to unmount the EFI system partition")]
    EfiUnmount(#[source] io::Error),

    #[error("failed to write boot code to {disk}")]
    Bootcode {
        disk: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Be(#[from] be::BeError),
}

/// Synchronizes boot code on every pool disk from `stage_root`'s boot
/// files. Any per-disk failure fails the whole update: a machine that boots
/// from the one disk we skipped would load a stale loader.
pub async fn update(stage_root: &Path, reporter: &Reporter) -> BootResult<()> {
    reporter.info("Updating bootloader");

    let pool = be::active_pool().await?;

    for disk in pool_disks(&pool).await? {
        let table = gpart_show(&disk).await?;

        match classify(&table) {
            Some(DiskBoot::Uefi) => {
                reporter.info(fomat!("Updating EFI bootloader on: " (disk)));
                update_uefi(&disk, &table, stage_root).await?;
            }
            Some(DiskBoot::BiosGpt) => {
                reporter.info(fomat!("Updating GPT bootloader on: " (disk)));
                update_gpt(&disk, &table, stage_root).await?;
            }
            None => return Err(BootloaderError::Unclassified { disk }),
        }
    }

    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DiskBoot {
    Uefi,
    BiosGpt,
}

async fn pool_disks(pool: &str) -> BootResult<Vec<String>> {
    let listing = misc::sysctl("kern.disks").await.map_err(BootloaderError::Disks)?;
    let status = zpool_status(pool).await?;

    let mut disks = Vec::new();

    for disk in listing.split_whitespace() {
        // Optical drives show up in the kernel disk list.
        if disk.starts_with("cd") {
            continue;
        }

        let uuids = disk_uuids(disk).await.unwrap_or_default();

        if disk_in_pool(&status, disk, &uuids) {
            info!("bootloader will be updated on disk {}", disk);
            disks.push(disk.to_owned());
        }
    }

    Ok(disks)
}

async fn zpool_status(pool: &str) -> BootResult<String> {
    let output = cascade! {
        Command::new("zpool");
        ..arg("status");
        ..arg(pool);
    }
    .output()
    .await
    .and_then(|output| output.status.into_result().map(|_| output))
    .map_err(|source| BootloaderError::PoolStatus { pool: pool.to_owned(), source })?;

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn disk_uuids(disk: &str) -> io::Result<Vec<String>> {
    let output = Command::new("gpart").args(&["list", disk]).output().await?;

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| line.contains("rawuuid:"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(String::from)
        .collect())
}

async fn gpart_show(disk: &str) -> BootResult<String> {
    let output = Command::new("gpart")
        .args(&["show", disk])
        .output()
        .await
        .and_then(|output| output.status.into_result().map(|_| output))
        .map_err(|source| BootloaderError::Gpart { disk: disk.to_owned(), source })?;

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn update_uefi(disk: &str, table: &str, stage_root: &Path) -> BootResult<()> {
    let index = partition_index(table, "efi")
        .ok_or_else(|| BootloaderError::NoEfiPartition { disk: disk.to_owned() })?;

    let device = format!("/dev/{}p{}", disk, index);

    let scratch = tempfile::tempdir().map_err(BootloaderError::EfiScratch)?;

    let esp = Mount::builder()
        .fstype("msdosfs")
        .mount(&device, scratch.path())
        .map_err(|source| BootloaderError::EfiMount { device, source })?;

    let boot_dir = scratch.path().join("efi/boot");
    fs::create_dir_all(&boot_dir)
        .map_err(|source| BootloaderError::EfiInstall { target: boot_dir.clone(), source })?;

    // The loader is installed under the name already in use; a first
    // install prefers the distribution-specific one.
    let preferred = boot_dir.join("bootx64-snapup.efi");
    let target = if preferred.exists() { boot_dir.join("bootx64.efi") } else { preferred };

    misc::cp(&stage_root.join("boot/loader.efi"), &target)
        .await
        .map_err(|source| BootloaderError::EfiInstall { target, source })?;

    esp.unmount(UnmountFlags::FORCE).map_err(BootloaderError::EfiUnmount)?;

    Ok(())
}

async fn update_gpt(disk: &str, table: &str, stage_root: &Path) -> BootResult<()> {
    let index = partition_index(table, "freebsd-boot")
        .ok_or_else(|| BootloaderError::NoBootPartition { disk: disk.to_owned() })?;

    cascade! {
        Command::new("gpart");
        ..arg("bootcode");
        ..arg("-b");
        ..arg(stage_root.join("boot/pmbr"));
        ..arg("-p");
        ..arg(stage_root.join("boot/gptzfsboot"));
        ..args(&["-i", index, disk]);
    }
    .status()
    .await
    .map_result()
    .map_err(|source| BootloaderError::Bootcode { disk: disk.to_owned(), source })
}

fn classify(table: &str) -> Option<DiskBoot> {
    for line in table.lines() {
        if line.contains(" efi ") {
            return Some(DiskBoot::Uefi);
        }

        if line.contains("freebsd-boot") {
            return Some(DiskBoot::BiosGpt);
        }
    }

    None
}

/// Partition index of the first entry of `ptype`, as the partitioning tool
/// prints it: start, size, index, type.
fn partition_index<'a>(table: &'a str, ptype: &str) -> Option<&'a str> {
    let marker = format!(" {} ", ptype);

    table
        .lines()
        .map(str::trim)
        .find(|line| line.contains(&marker))
        .and_then(|line| line.split_whitespace().nth(2))
}

fn disk_in_pool(status: &str, disk: &str, uuids: &[String]) -> bool {
    let bare = format!(" {} ", disk);
    let partitioned = format!(" {}p", disk);

    for line in status.lines() {
        if line.contains(&bare) || line.contains(&partitioned) {
            return true;
        }

        if uuids.iter().any(|uuid| line.contains(&format!(" gptid/{}", uuid))) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const UEFI_TABLE: &str = "=>       40  488397088  ada0  GPT  (233G)
         40     532480     1  efi  (260M)
     532520       1024     2  freebsd-boot  (512K)
     533544  483964928     3  freebsd-zfs  (231G)
  484498472    3898656        - free -  (1.9G)
";

    const GPT_TABLE: &str = "=>       40  976773088  da0  GPT  (466G)
         40       1024    1  freebsd-boot  (512K)
       1064  968884224    2  freebsd-zfs  (462G)
  968885288    7887840    3  freebsd-swap  (3.8G)
";

    #[test]
    fn classify_prefers_the_first_boot_partition() {
        assert_eq!(classify(UEFI_TABLE), Some(DiskBoot::Uefi));
        assert_eq!(classify(GPT_TABLE), Some(DiskBoot::BiosGpt));
        assert_eq!(classify("=>  40  88  da1  GPT  (4.0G)\n"), None);
    }

    #[test]
    fn partition_indices() {
        assert_eq!(partition_index(UEFI_TABLE, "efi"), Some("1"));
        assert_eq!(partition_index(UEFI_TABLE, "freebsd-boot"), Some("2"));
        assert_eq!(partition_index(GPT_TABLE, "freebsd-boot"), Some("1"));
        assert_eq!(partition_index(GPT_TABLE, "efi"), None);
    }

    #[test]
    fn pool_membership() {
        let status = "  pool: zroot
 state: ONLINE
config:

	NAME        STATE     READ WRITE CKSUM
	zroot       ONLINE       0     0     0
	  mirror-0  ONLINE       0     0     0
	    ada0p3  ONLINE       0     0     0
	    gptid/6c83e91a-77a9-11ec-a4e4  ONLINE  0  0  0
";

        assert!(disk_in_pool(status, "ada0", &[]));
        assert!(!disk_in_pool(status, "ada1", &[]));
        assert!(disk_in_pool(status, "da2", &["6c83e91a-77a9-11ec-a4e4".to_owned()]));
    }
}
