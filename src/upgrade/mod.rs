//! Stage 1 of an upgrade session: everything between receiving a request
//! and handing the machine to the reboot.
//!
//! The pipeline is strictly sequential. Nothing outside the disposable
//! staging environment is mutated until the very end, so any failure before
//! `rename_and_activate` leaves the running system and its boot target
//! untouched.

mod errors;

pub use self::errors::{UpResult, UpgradeError};

use crate::{
    be, bootloader, bootstrap,
    config::DaemonConfig,
    events::Reporter,
    executor::{self, Target},
    offline::OfflineImage,
    pkgdb, plan,
    protocol::{Message, UpdateRequest},
    session::Session,
    STAGE_DIR,
};
use std::path::Path;

/// Serves a `check` request: negotiate the database, refresh, dry-run, and
/// reply with the resulting plan. Nothing is mutated.
pub async fn check(
    config: &DaemonConfig,
    offline: OfflineImage,
    reporter: &Reporter,
) -> UpResult<()> {
    let mut session = Session::new(UpdateRequest::default(), config, offline);

    let result = check_inner(&mut session, reporter).await;

    // A check session owns no stage; the image is its only resource.
    session.offline.detach().await;

    let (updates, details) = result?;
    reporter.send(Message::Check { updates, details });

    Ok(())
}

async fn check_inner(
    session: &mut Session,
    reporter: &Reporter,
) -> UpResult<(bool, plan::UpdatePlan)> {
    pkgdb::prepare(session, reporter).await?;
    pkgdb::refresh(session, reporter).await?;

    let kernel = plan::kernel_package(session).await?;
    let transcript = plan::dry_run(session).await?;

    if !plan::have_updates(&transcript) {
        return Ok((false, plan::UpdatePlan { kernel_pkg: kernel, ..Default::default() }));
    }

    let mut details = plan::parse_dry_run(&transcript, &kernel);

    if plan::host_abi_changed(session, reporter).await? {
        details.kernel_up = true;
    }

    Ok((true, details))
}

/// Serves an `update` request: the full stage-1 pipeline. On success the
/// client receives a `shutdown` event and the machine is ready to reboot
/// into the staged environment.
pub async fn update(
    request: UpdateRequest,
    config: &DaemonConfig,
    offline: OfflineImage,
    reporter: &Reporter,
) -> UpResult<()> {
    let mut session = Session::new(request, config, offline);

    // Each session starts a fresh log.
    reporter.log().rotate();

    let result = update_inner(&mut session, reporter).await;

    if result.is_err() {
        // Pre-rename failures leave only the disposable stage and the
        // attached image behind.
        be::destroy_stage().await;
        session.offline.detach().await;
    }

    result
}

async fn update_inner(session: &mut Session, reporter: &Reporter) -> UpResult<()> {
    pkgdb::prepare(session, reporter).await?;
    pkgdb::refresh(session, reporter).await?;

    session.kernel_pkg = Some(plan::kernel_package(session).await?);

    reporter.info("Checking system for updates");
    let transcript = plan::dry_run(session).await?;

    if !plan::have_updates(&transcript) && !session.request.fullupdate {
        return Err(UpgradeError::NoUpdates);
    }

    let kernel = session.kernel_pkg.clone().unwrap_or_default();
    let mut details = plan::parse_dry_run(&transcript, &kernel);

    // A repository built against a different ABI forces the same ordering
    // as a kernel change.
    if plan::host_abi_changed(session, reporter).await? {
        details.kernel_up = true;
    }

    if details.kernel_up {
        session.request.fullupdate = true;
    }

    // Packages come from the mounted image when one was supplied.
    if session.request.offline_image().is_none() {
        executor::fetch(session, reporter, session.request.fullupdate).await?;
    }

    if session.request.fetchonly {
        session.offline.detach().await;
        reporter.shutdown("Package downloads complete.");
        return Ok(());
    }

    // Our own package upgrades first, and the new binary finishes this
    // request; this process never reaches the stage.
    if details.self_up && !session.request.disablebs {
        return bootstrap::run(session, reporter).await;
    }

    be::create_stage(session, reporter).await?;
    be::bind_image_mount(session).await?;

    if details.kernel_up {
        executor::upgrade_kernel(session, reporter).await?;
    } else {
        executor::upgrade(session, reporter, Target::Staged, session.request.fullupdate)
            .await?;
    }

    bootloader::update(Path::new(STAGE_DIR), reporter).await?;

    be::unbind_image_mount(session, Path::new(STAGE_DIR)).await;

    let name = be::rename_and_activate(session, reporter).await?;
    info!("staged upgrade activated as boot environment {}", name);

    session.offline.detach().await;
    reporter.shutdown("Success! Reboot your system to continue the update process.");

    Ok(())
}
