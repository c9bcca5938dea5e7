//! The two records that carry a session across the reboot boundary.
//!
//! Process memory does not survive the reboot between stage 1 and stage 2,
//! so the chosen new BE name and the previously-active BE name are written
//! into the staging environment as small text files and read back from the
//! booted root. Stage 2 only ever goes through this accessor.

use std::{fs, io, path::Path};
use thiserror::Error;

const NEW_BE_FILE: &str = "var/db/snapup/new-be";
const PREVIOUS_BE_FILE: &str = "var/db/snapup/previous-be";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to persist session state under {root:?}")]
    Write {
        root: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read persisted session state from {root:?}")]
    Read {
        root: String,
        #[source]
        source: io::Error,
    },

    #[error("persisted boot environment name under {root:?} is empty")]
    Empty { root: String },
}

/// Names handed from stage 1 to stage 2.
#[derive(Clone, Debug, PartialEq)]
pub struct StageHandoff {
    pub new_be: String,
    pub previous_be: String,
}

impl StageHandoff {
    /// Persists both names under `root` (the staging environment's mount
    /// point in stage 1).
    pub fn write_to(&self, root: &Path) -> Result<(), StateError> {
        let write = |relative: &str, value: &str| {
            let path = root.join(relative);

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(path, format!("{}\n", value))
        };

        write(NEW_BE_FILE, &self.new_be)
            .and_then(|_| write(PREVIOUS_BE_FILE, &self.previous_be))
            .map_err(|source| StateError::Write { root: root.display().to_string(), source })
    }

    /// Reads both names back from `root` (the booted root in stage 2).
    pub fn read_from(root: &Path) -> Result<Self, StateError> {
        let read = |relative: &str| -> Result<String, StateError> {
            let value = fs::read_to_string(root.join(relative))
                .map_err(|source| StateError::Read { root: root.display().to_string(), source })?;

            let value = value.trim();
            if value.is_empty() {
                return Err(StateError::Empty { root: root.display().to_string() });
            }

            Ok(value.to_owned())
        };

        Ok(Self { new_be: read(NEW_BE_FILE)?, previous_be: read(PREVIOUS_BE_FILE)? })
    }

    /// Whether a finalization is pending under `root`.
    pub fn pending(root: &Path) -> bool {
        root.join(NEW_BE_FILE).exists() && root.join(PREVIOUS_BE_FILE).exists()
    }

    /// Removes the persisted records once stage 2 has finished with them.
    pub fn clear(root: &Path) {
        for relative in &[NEW_BE_FILE, PREVIOUS_BE_FILE] {
            let _ = fs::remove_file(root.join(relative));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let handoff =
            StageHandoff { new_be: "13.1-RELEASE".into(), previous_be: "default".into() };

        assert!(!StageHandoff::pending(root.path()));
        handoff.write_to(root.path()).unwrap();

        assert!(StageHandoff::pending(root.path()));
        assert_eq!(StageHandoff::read_from(root.path()).unwrap(), handoff);
    }

    #[test]
    fn clear_removes_pending_state() {
        let root = tempfile::tempdir().unwrap();
        StageHandoff { new_be: "a".into(), previous_be: "b".into() }
            .write_to(root.path())
            .unwrap();

        StageHandoff::clear(root.path());
        assert!(!StageHandoff::pending(root.path()));
        assert!(StageHandoff::read_from(root.path()).is_err());
    }

    #[test]
    fn empty_name_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        StageHandoff { new_be: "  ".into(), previous_be: "default".into() }
            .write_to(root.path())
            .unwrap();

        assert!(matches!(
            StageHandoff::read_from(root.path()),
            Err(StateError::Empty { .. })
        ));
    }
}
