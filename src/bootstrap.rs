//! Self-bootstrap: when the pending change set contains this tool's own
//! package, upgrading it mid-session would leave stale code running the
//! rest of the upgrade. Instead the package is upgraded on the live host
//! and the fresh binary re-runs the same request as a child process on a
//! private port, with its output relayed to the original client.

use crate::{
    events::Reporter,
    executor,
    session::Session,
    upgrade::{UpResult, UpgradeError},
    SELF_PACKAGE,
};
use std::{fs, io, net::TcpListener, path::Path};
use tokio::process::Command;

pub async fn run(session: &Session, reporter: &Reporter) -> UpResult<()> {
    reporter.info("Starting snapup self-bootstrap");

    executor::upgrade_self(session, reporter).await?;

    // The re-executed binary must see the database view this session
    // negotiated, so the mirror replaces the live one.
    let live = Path::new("/var/db/pkg");
    if let Err(why) = fs::remove_dir_all(live) {
        if why.kind() != io::ErrorKind::NotFound {
            return Err(UpgradeError::DbSwap(why));
        }
    }

    fs::rename(&session.layout.pkg_db, live).map_err(UpgradeError::DbSwap)?;

    reporter.info("Finished stage 1 of the self-bootstrap");

    // The child attaches the image itself; release this session's handle.
    session.offline.detach().await;

    passthrough(session, reporter).await?;

    reporter.shutdown("");
    Ok(())
}

/// Re-executes the upgraded binary with the original request's flags.
async fn passthrough(session: &Session, reporter: &Reporter) -> UpResult<()> {
    let port = free_port().map_err(|source| UpgradeError::Bootstrap {
        package: SELF_PACKAGE,
        source: source.into(),
    })?;

    let request = &session.request;
    let mut args = vec![
        "--addr".to_owned(),
        format!("127.0.0.1:{}", port),
        "update".to_owned(),
    ];

    if request.fullupdate {
        args.push("--fullupdate".to_owned());
    }

    if !request.cachedir.is_empty() {
        args.push(format!("--cachedir={}", request.cachedir));
    }

    if !request.updatefile.is_empty() {
        args.push(format!("--updatefile={}", request.updatefile));
    }

    if !request.bename.is_empty() {
        args.push(format!("--bename={}", request.bename));
    }

    if !request.updatekey.is_empty() {
        args.push(format!("--updatekey={}", request.updatekey));
    }

    if request.fetchonly {
        args.push("--fetch-only".to_owned());
    }

    reporter.info(fomat!("Re-executing upgraded binary: snapup " (args.join(" "))));

    let mut cmd = Command::new(SELF_PACKAGE);
    cmd.args(&args);

    executor::stream(cmd, "snapup passthrough", session, reporter).await
}

/// Asks the system for an unused private port to run the hand-off on.
fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_is_ephemeral() {
        let port = free_port().unwrap();
        assert!(port >= 1024);
    }
}
