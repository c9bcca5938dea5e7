//! Negotiates the package tool's working configuration against the remote
//! repository, including recovery from a mismatched system ABI.
//!
//! The local installation database is mirrored into the session's state
//! directory first, so every diff the package tool computes runs against a
//! copy and the live system stays untouched.

use crate::{events::Reporter, misc, offline, session::Session};
use regex::Regex;
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Stdio,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

pub type PkgDbResult<T> = Result<T, PkgDbError>;

#[derive(Debug, Error)]
pub enum PkgDbError {
    #[error("failed to create package state directory {dir:?}")]
    StateDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to mirror the local package database")]
    MirrorDb(#[source] io::Error),

    #[error("failed to write package tool configuration {path:?}")]
    WriteConf {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to run the repository catalogue refresh")]
    Refresh(#[source] io::Error),

    #[error("repository catalogue refresh failed:\n{tail}")]
    RefreshFailed { tail: String },

    #[error("repository ABI mismatch persists after overriding to {abi}")]
    AbiLoop { abi: String },

    #[error("ABI diagnostic named no recognizable architecture: {line:?}")]
    AbiUnparsed { line: String },

    #[error(transparent)]
    Offline(#[from] offline::OfflineError),
}

/// Local installation database of the live system.
const LOCAL_DB: &str = "/var/db/pkg/local.sqlite";

/// Builds the session's package database: state directories, the offline
/// repository (when an image was supplied), the mirrored local database,
/// and the configuration file every later invocation consumes.
pub async fn prepare(session: &mut Session, reporter: &Reporter) -> PkgDbResult<()> {
    reporter.info("Preparing package database");

    for dir in &[&session.layout.pkg_db, &session.layout.cache_dir] {
        fs::create_dir_all(dir)
            .map_err(|source| PkgDbError::StateDir { dir: (*dir).clone(), source })?;
    }

    let image = session.request.offline_image().map(String::from);
    if let Some(image) = image {
        let offline = session.offline.clone();
        offline.mount(Path::new(&image), &session.layout.img_mnt).await?;

        session.repos_fragment = Some(offline::synthesize_repo(
            Path::new("/"),
            &session.layout.pkg_db,
            &session.layout.img_mnt,
            &session.request.updatekey,
        )?);
    }

    misc::cp(Path::new(LOCAL_DB), &session.layout.pkg_db.join("local.sqlite"))
        .await
        .map_err(PkgDbError::MirrorDb)?;

    write_conf(session)
}

/// Refreshes the remote catalogue, retrying exactly once with a corrected
/// ABI override when the diagnostic stream names one. A second mismatch is
/// fatal rather than recursing.
pub async fn refresh(session: &mut Session, reporter: &Reporter) -> PkgDbResult<()> {
    reporter.info("Updating package repository catalogue");

    let corrected = match attempt(session).await? {
        None => return Ok(()),
        Some(token) => token,
    };

    reporter.info(fomat!("Retrying catalogue refresh with corrected ABI: " (corrected)));
    session.abi_override = Some(corrected.clone());
    write_conf(session)?;

    match attempt(session).await? {
        None => Ok(()),
        Some(_) => Err(PkgDbError::AbiLoop { abi: corrected }),
    }
}

/// One catalogue refresh. `Ok(Some(token))` reports an ABI mismatch whose
/// diagnostic carried a usable replacement token.
async fn attempt(session: &Session) -> PkgDbResult<Option<String>> {
    let mut child = session
        .pkg_conf()
        .args(&["update", "-f"])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(PkgDbError::Refresh)?;

    // The stderr pipe is always present with the setup above.
    let stderr = match child.stderr.take() {
        Some(stderr) => stderr,
        None => return Err(PkgDbError::Refresh(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "stderr of the catalogue refresh was not captured",
        ))),
    };

    let mut lines = BufReader::new(stderr).lines();
    let mut mismatch = None;
    let mut unparsed = None;
    let mut tail = Vec::new();

    while let Some(line) = lines.next_line().await.map_err(PkgDbError::Refresh)? {
        if line.contains("wrong ABI:") && mismatch.is_none() && unparsed.is_none() {
            match abi_token(&line) {
                Some(token) => mismatch = Some(token),
                None => unparsed = Some(line.clone()),
            }
        }

        tail.push(line);
    }

    let status = child.wait().await.map_err(PkgDbError::Refresh)?;

    if status.success() {
        Ok(None)
    } else if let Some(token) = mismatch {
        Ok(Some(token))
    } else if let Some(line) = unparsed {
        Err(PkgDbError::AbiUnparsed { line })
    } else {
        let start = tail.len().saturating_sub(15);
        Err(PkgDbError::RefreshFailed { tail: tail[start..].join("\n") })
    }
}

/// Renders the configuration consumed by host-side invocations.
pub fn render_conf(session: &Session) -> String {
    let mut out = format!(
        "PKG_CACHEDIR: {}\nPKG_DBDIR: {}\nIGNORE_OSVERSION: YES\n",
        session.layout.cache_dir.display(),
        session.layout.pkg_db.display()
    );

    append_common(&mut out, session);
    out
}

/// Renders the configuration written into the staging boot environment,
/// where the default database location is the right one and the repository
/// descriptor lives under that default.
pub fn render_staged_conf(session: &Session, repos: Option<&str>) -> String {
    let mut out = format!(
        "PKG_CACHEDIR: {}\nIGNORE_OSVERSION: YES\n",
        session.layout.cache_dir.display()
    );

    if let Some(repos) = repos {
        out.push_str(repos);
        out.push('\n');
    }

    append_abi(&mut out, session);
    out
}

fn append_common(out: &mut String, session: &Session) {
    if let Some(repos) = &session.repos_fragment {
        out.push_str(repos);
        out.push('\n');
    }

    append_abi(out, session);
}

fn append_abi(out: &mut String, session: &Session) {
    if let Some(abi) = &session.abi_override {
        out.push_str(&format!("ABI: {}\n", abi));
    }
}

pub fn write_conf(session: &Session) -> PkgDbResult<()> {
    fs::write(&session.layout.pkg_conf, render_conf(session)).map_err(|source| {
        PkgDbError::WriteConf { path: session.layout.pkg_conf.clone(), source }
    })
}

/// Extracts the corrected architecture token from a `wrong ABI` diagnostic.
fn abi_token(line: &str) -> Option<String> {
    let start = line.find("wrong ABI:")?;

    Regex::new(r"[A-Za-z]+:[0-9]+:[A-Za-z0-9_]+")
        .ok()?
        .find(&line[start..])
        .map(|token| token.as_str().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DaemonConfig, events::Reporter, offline::OfflineImage,
        protocol::UpdateRequest, session_log::SessionLog,
    };
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use test_case::test_case;
    use tokio::sync::mpsc::unbounded_channel;

    fn session() -> Session {
        Session::new(UpdateRequest::default(), &DaemonConfig::default(), OfflineImage::default())
    }

    /// A session whose package tool is a shell script and whose state lives
    /// in a scratch directory.
    fn scripted_session(dir: &TempDir, script: &str) -> (Session, Reporter) {
        let tool = dir.path().join("fake-pkg");
        fs::write(&tool, script).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let request = UpdateRequest {
            cachedir: dir.path().join("state").display().to_string(),
            ..Default::default()
        };

        let config = DaemonConfig { pkgbin: tool.display().to_string(), ..Default::default() };
        let session = Session::new(request, &config, OfflineImage::default());
        fs::create_dir_all(&session.layout.state_root).unwrap();

        let (tx, _rx) = unbounded_channel();
        let reporter = Reporter::new(tx, SessionLog::new(dir.path().join("session.log")));

        (session, reporter)
    }

    #[tokio::test]
    async fn abi_mismatch_is_retried_once_with_the_corrected_token() {
        let dir = tempfile::tempdir().unwrap();

        // Succeeds only once the configuration carries an ABI override,
        // mirroring a repository that insists on a corrected architecture.
        let (mut session, reporter) = scripted_session(
            &dir,
            "#!/bin/sh\n\
             if grep -q '^ABI:' \"$2\"; then exit 0; fi\n\
             echo 'pkg: wrong ABI: FreeBSD:13:amd64 instead of FreeBSD:12:amd64' >&2\n\
             exit 1\n",
        );

        write_conf(&session).unwrap();
        refresh(&mut session, &reporter).await.unwrap();

        assert_eq!(session.abi_override.as_deref(), Some("FreeBSD:13:amd64"));

        let conf = fs::read_to_string(&session.layout.pkg_conf).unwrap();
        assert!(conf.contains("ABI: FreeBSD:13:amd64"));
    }

    #[tokio::test]
    async fn persistent_abi_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();

        let (mut session, reporter) = scripted_session(
            &dir,
            "#!/bin/sh\n\
             echo 'pkg: wrong ABI: FreeBSD:13:amd64 instead of FreeBSD:12:amd64' >&2\n\
             exit 1\n",
        );

        write_conf(&session).unwrap();
        let result = refresh(&mut session, &reporter).await;

        assert!(
            matches!(result, Err(PkgDbError::AbiLoop { ref abi }) if abi == "FreeBSD:13:amd64")
        );
    }

    #[tokio::test]
    async fn unrelated_refresh_failure_reports_the_tail() {
        let dir = tempfile::tempdir().unwrap();

        let (mut session, reporter) = scripted_session(
            &dir,
            "#!/bin/sh\necho 'repository catalogue is corrupt' >&2\nexit 1\n",
        );

        write_conf(&session).unwrap();
        let result = refresh(&mut session, &reporter).await;

        assert!(
            matches!(result, Err(PkgDbError::RefreshFailed { ref tail }) if tail.contains("corrupt"))
        );
    }

    #[test_case(
        "pkg: wrong ABI: FreeBSD:13:amd64 instead of FreeBSD:12:amd64",
        Some("FreeBSD:13:amd64");
        "plain diagnostic"
    )]
    #[test_case(
        "Unable to update repository: wrong ABI: expected FreeBSD:14:aarch64",
        Some("FreeBSD:14:aarch64");
        "prefixed diagnostic"
    )]
    #[test_case("repository metadata is corrupt", None; "unrelated line")]
    #[test_case("pkg: wrong ABI: (unknown)", None; "no token present")]
    fn abi_token_extraction(line: &str, expected: Option<&str>) {
        assert_eq!(abi_token(line).as_deref(), expected);
    }

    #[test]
    fn host_conf_contents() {
        let session = session();
        let conf = render_conf(&session);

        assert!(conf.contains("PKG_CACHEDIR: /var/db/snapup/cache"));
        assert!(conf.contains("PKG_DBDIR: /var/db/snapup/pkgdb"));
        assert!(conf.contains("IGNORE_OSVERSION: YES"));
        assert!(!conf.contains("ABI:"));
    }

    #[test]
    fn staged_conf_uses_default_db() {
        let mut session = session();
        session.abi_override = Some("FreeBSD:13:amd64".into());

        let conf =
            render_staged_conf(&session, Some("REPOS_DIR: [ \"/var/db/pkg/repos\", ]"));
        assert!(!conf.contains("PKG_DBDIR"));
        assert!(conf.contains("REPOS_DIR: [ \"/var/db/pkg/repos\", ]"));
        assert!(conf.ends_with("ABI: FreeBSD:13:amd64\n"));
    }
}
