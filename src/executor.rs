//! Runs the package upgrade itself, either against the staging boot
//! environment or against the live system after reboot.
//!
//! Both modes share one execution contract: stream every output line to the
//! client and the session log, and drain stdout and stderr on two
//! independently scheduled tasks joined before the exit status is read. A
//! full pipe buffer on either stream would otherwise deadlock the child.

use crate::{
    events::Reporter,
    session::Session,
    upgrade::{UpResult, UpgradeError},
    CRITICAL_PACKAGES, SELF_PACKAGE,
};
use std::{io, process::Stdio};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};

const ERROR_TAIL: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Target {
    /// Operates on the staging boot environment via the tool's root
    /// override.
    Staged,
    /// Operates on the booted system; used by stage 2 after the reboot.
    Live,
}

impl Target {
    fn command(self, session: &Session) -> Command {
        match self {
            Target::Staged => session.pkg_staged(),
            Target::Live => session.pkg_conf(),
        }
    }
}

/// The full upgrade pass: refresh the package tool itself, upgrade
/// everything, pin the upgrade-critical packages, and clean up orphans.
pub async fn upgrade(
    session: &Session,
    reporter: &Reporter,
    target: Target,
    full: bool,
) -> UpResult<()> {
    reporter.info("Starting package upgrade");

    let mut tool = target.command(session);
    tool.args(&["upgrade", "-U", "-y", "-f", "ports-mgmt/pkg"]);
    stream(tool, "pkg tool upgrade", session, reporter).await?;

    let mut main = target.command(session);
    main.args(&["upgrade", "-U", "-y"]);

    if target == Target::Staged {
        // Install scripts cannot run against a chrooted stage.
        main.arg("-I");
    }

    if full {
        main.arg("-f");
    }

    stream(main, "pkg upgrade", session, reporter).await?;

    mark_critical(session, reporter, target).await;
    autoremove(session, reporter, target).await;

    reporter.info("Finished package upgrade");
    Ok(())
}

/// Kernel-first ordering: only the kernel package lands in the stage; the
/// remainder of the upgrade runs live after the reboot.
pub async fn upgrade_kernel(session: &Session, reporter: &Reporter) -> UpResult<()> {
    let kernel = session.kernel_pkg.clone().unwrap_or_default();
    reporter.info(fomat!("Kernel change detected, staging " (kernel) " first"));

    let mut cmd = session.pkg_staged();
    cmd.args(&["upgrade", "-U", "-y", "-f", kernel.as_str()]);

    stream(cmd, "pkg kernel upgrade", session, reporter).await
}

/// Upgrades only this tool's own package on the live host, ahead of the
/// self-bootstrap hand-off.
pub async fn upgrade_self(session: &Session, reporter: &Reporter) -> UpResult<()> {
    let mut cmd = session.pkg_conf();
    cmd.args(&["upgrade", "-U", "-y", "-f", SELF_PACKAGE]);

    stream(cmd, "pkg self upgrade", session, reporter).await
}

/// Downloads pending packages into the session cache without applying them.
pub async fn fetch(session: &Session, reporter: &Reporter, full: bool) -> UpResult<()> {
    reporter.info("Starting package downloads");

    let mut cmd = session.pkg_conf();
    cmd.args(&["upgrade", "-F", "-y", "-U"]);

    if full {
        cmd.arg("-f");
    }

    stream(cmd, "pkg fetch", session, reporter).await?;

    reporter.info("Finished package downloads");
    Ok(())
}

/// Spawns `cmd`, relays every stdout line, and gathers a stderr tail. On a
/// non-zero exit the offline image is detached and the failure is recorded
/// for post-mortem debugging before the error is returned.
pub(crate) async fn stream(
    mut cmd: Command,
    label: &str,
    session: &Session,
    reporter: &Reporter,
) -> UpResult<()> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|source| UpgradeError::Spawn { command: label.to_owned(), source })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_reporter = reporter.clone();
    let out_task = tokio::spawn(async move {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                out_reporter.info(line);
            }
        }

        Ok::<(), io::Error>(())
    });

    let err_log = reporter.log().clone();
    let err_task = tokio::spawn(async move {
        let mut tail = Vec::new();

        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                err_log.append(&line);

                if tail.len() == ERROR_TAIL {
                    tail.remove(0);
                }

                tail.push(line);
            }
        }

        Ok::<Vec<String>, io::Error>(tail)
    });

    // Both drains must complete before the exit status is inspected.
    let drain = |source: io::Error| UpgradeError::Drain { command: label.to_owned(), source };

    let (out, tail) = futures::try_join!(out_task, err_task)
        .map_err(|why| drain(io::Error::new(io::ErrorKind::Other, why)))?;

    out.map_err(drain)?;
    let tail = tail.map_err(drain)?;

    let status = child.wait().await.map_err(drain)?;

    if !status.success() {
        session.offline.detach().await;

        for line in &tail {
            reporter.info(line.clone());
        }

        reporter.log().snapshot_failure();

        return Err(UpgradeError::CommandFailed {
            command: label.to_owned(),
            tail: tail.join("\n"),
        });
    }

    Ok(())
}

/// Pins the packages the next upgrade must never drop. The upgrade already
/// succeeded at this point, so failures only cost the pin.
async fn mark_critical(session: &Session, reporter: &Reporter, target: Target) {
    for package in CRITICAL_PACKAGES.iter().copied() {
        let mut cmd = target.command(session);
        cmd.args(&["set", "-y", "-A", "00", package]);
        relay_output(cmd, reporter).await;
    }
}

async fn autoremove(session: &Session, reporter: &Reporter, target: Target) {
    let mut cmd = target.command(session);
    cmd.args(&["autoremove", "-y"]);
    relay_output(cmd, reporter).await;
}

/// Best-effort execution relaying whatever the command printed.
async fn relay_output(mut cmd: Command, reporter: &Reporter) {
    match cmd.output().await {
        Ok(output) => {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                reporter.info(line);
            }

            if !output.status.success() {
                warn!("command exited with {:?}", output.status.code());
            }
        }
        Err(why) => warn!("failed to run command: {}", why),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DaemonConfig, events::Reporter, offline::OfflineImage,
        protocol::UpdateRequest, session_log::SessionLog, STAGE_DIR,
    };
    use tokio::sync::mpsc::unbounded_channel;

    fn fixture(log: SessionLog) -> (Session, Reporter) {
        let session = Session::new(
            UpdateRequest::default(),
            &DaemonConfig::default(),
            OfflineImage::default(),
        );

        let (tx, _rx) = unbounded_channel();
        (session, Reporter::new(tx, log))
    }

    #[tokio::test]
    async fn streams_stdout_into_the_session_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));
        let (session, reporter) = fixture(log.clone());

        let mut cmd = Command::new("sh");
        cmd.args(&["-c", "echo staging packages; echo done"]);

        stream(cmd, "echo", &session, &reporter).await.unwrap();

        let logged = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(logged, "staging packages\ndone\n");
    }

    #[tokio::test]
    async fn failure_carries_the_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));
        let (session, reporter) = fixture(log);

        let mut cmd = Command::new("sh");
        cmd.args(&["-c", "echo catalogue is corrupt >&2; exit 3"]);

        let result = stream(cmd, "pkg upgrade", &session, &reporter).await;

        match result {
            Err(UpgradeError::CommandFailed { command, tail }) => {
                assert_eq!(command, "pkg upgrade");
                assert_eq!(tail, "catalogue is corrupt");
            }
            other => panic!("expected a command failure: {:?}", other),
        }
    }

    #[tokio::test]
    async fn large_output_does_not_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));
        let (session, reporter) = fixture(log);

        // Interleaves far more data than a pipe buffer holds on both
        // streams; completion proves the concurrent drain works.
        let mut cmd = Command::new("sh");
        cmd.args(&["-c", "i=0; while [ $i -lt 20000 ]; do echo line $i; echo err $i >&2; i=$((i+1)); done"]);

        stream(cmd, "flood", &session, &reporter).await.unwrap();
    }

    #[test]
    fn target_commands() {
        let (session, _) = fixture(SessionLog::new("/tmp/unused.log"));

        let staged = Target::Staged.command(&session);
        let args = staged.as_std().get_args().collect::<Vec<_>>();
        assert_eq!(args[0], "-c");
        assert_eq!(args[1], STAGE_DIR);

        let live = Target::Live.command(&session);
        let args = live.as_std().get_args().collect::<Vec<_>>();
        assert_eq!(args[0], "-C");
    }
}
