//! Stage 2: finalization on the first boot into the staged environment.
//!
//! No state survives the reboot except the two persisted name records, so
//! everything is re-read from disk. The very first action is to reactivate
//! the previously-active environment: from that point on, a crash or any
//! failure below reboots the machine back into a known-good system. Only
//! after the live upgrade pass succeeds is the new environment activated
//! again and the bootloader resynchronized.

use crate::{
    be::{self, state::StageHandoff},
    bootloader,
    config::DaemonConfig,
    events::Reporter,
    executor::{self, Target},
    offline::OfflineImage,
    protocol::UpdateRequest,
    session::Session,
    upgrade::{UpResult, UpgradeError},
    COMPAT_KMODS,
};
use as_result::MapResult;
use std::path::Path;
use tokio::process::Command;

/// Entry point for the boot-time service. A failure here never propagates:
/// the previous environment is already the boot target, so the machine is
/// sent back into it.
pub async fn run(config: &DaemonConfig, reporter: &Reporter) -> UpResult<()> {
    let root = Path::new("/");

    if !StageHandoff::pending(root) {
        info!("no staged upgrade is pending, nothing to finalize");
        return Ok(());
    }

    match finalize(root, config, reporter).await {
        Ok(()) => Ok(()),
        Err(why) => {
            reporter.fatal(fomat!(
                "Finalization failed, rebooting into the previous boot environment: "
                (crate::misc::format_error(&why))
            ));

            reboot().await;
            Err(why)
        }
    }
}

async fn finalize(root: &Path, config: &DaemonConfig, reporter: &Reporter) -> UpResult<()> {
    // The boot may still be read-only this early.
    Command::new("mount")
        .args(&["-u", "-w", "/"])
        .status()
        .await
        .map_result()
        .map_err(UpgradeError::RemountRoot)?;

    let handoff = StageHandoff::read_from(root)?;

    reporter.info(fomat!("Finalizing upgrade of boot environment " (handoff.new_be)));

    // Crash safety first: whatever happens below, the machine comes back up
    // in the environment that is known to work.
    be::activate(&handoff.previous_be).await?;

    // Bring up the remaining filesystems for the live upgrade pass.
    let _ = Command::new("mount").arg("-a").status().await;

    for module in COMPAT_KMODS.iter().copied() {
        let _ = Command::new("kldload").args(&["-n", module]).status().await;
    }

    let session = Session::new(UpdateRequest::default(), config, OfflineImage::default());

    executor::upgrade(&session, reporter, Target::Live, false).await?;

    // Defensive: a leftover attachment cannot survive the reboot, but the
    // handle must be fresh for the next session either way.
    session.offline.detach().await;

    be::activate(&handoff.new_be).await?;
    bootloader::update(root, reporter).await?;

    StageHandoff::clear(root);

    reporter.shutdown(fomat!(
        "Upgrade finalized, " (handoff.new_be) " is the active boot environment."
    ));

    Ok(())
}

async fn reboot() {
    let _ = Command::new("reboot").status().await;
}
