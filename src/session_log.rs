//! Append-only log of one upgrade session, rotated at session start.
//!
//! Every line the package tool prints ends up here, so a failed upgrade can
//! be reconstructed after the fact. On fatal errors a `.failed` snapshot is
//! taken, since the next session start rotates the live log away.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

const ROTATIONS: u32 = 9;

#[derive(Clone, Debug)]
pub struct SessionLog {
    path: Arc<PathBuf>,
}

impl Default for SessionLog {
    fn default() -> Self { Self::new(crate::LOG_FILE) }
}

impl SessionLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self { Self { path: Arc::new(path.into()) } }

    pub fn path(&self) -> &Path { &self.path }

    /// Appends a line; logging must never abort an upgrade, so failures are
    /// reported through the process log instead of being returned.
    pub fn append(&self, line: &str) {
        let entry = OpenOptions::new().append(true).create(true).open(self.path.as_ref());

        match entry {
            Ok(mut file) => {
                if let Err(why) = writeln!(file, "{}", line) {
                    warn!("failed to append to {:?}: {}", self.path, why);
                }
            }
            Err(why) => warn!("failed to open session log {:?}: {}", self.path, why),
        }
    }

    /// Shifts numbered backups up and moves the previous session's log to
    /// the `.1` suffix.
    pub fn rotate(&self) {
        for num in (1..ROTATIONS).rev() {
            let from = self.numbered(num);
            if from.exists() {
                let _ = fs::rename(&from, self.numbered(num + 1));
            }
        }

        if self.path.exists() {
            let _ = fs::rename(self.path.as_ref(), self.numbered(1));
        }
    }

    /// Copies the session log to its failure twin for post-mortem debugging.
    pub fn snapshot_failure(&self) {
        if !self.path.exists() {
            return;
        }

        let failed = self.path.with_extension("failed");
        if let Err(why) = fs::copy(self.path.as_ref(), &failed) {
            warn!("failed to copy session log to {:?}: {}", failed, why);
        }
    }

    fn numbered(&self, num: u32) -> PathBuf {
        let mut path = self.path.as_os_str().to_owned();
        path.push(format!(".{}", num));
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));

        log.append("first session");
        log.rotate();
        log.append("second session");

        assert_eq!(
            fs::read_to_string(dir.path().join("session.log.1")).unwrap(),
            "first session\n"
        );
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "second session\n");
    }

    #[test]
    fn rotation_depth() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));

        for session in 0..12 {
            log.append(&format!("session {}", session));
            log.rotate();
        }

        assert!(dir.path().join("session.log.9").exists());
        assert!(!dir.path().join("session.log.10").exists());
    }

    #[test]
    fn failure_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path().join("session.log"));

        log.append("went sideways");
        log.snapshot_failure();

        assert_eq!(
            fs::read_to_string(dir.path().join("session.failed")).unwrap(),
            "went sideways\n"
        );
    }
}
