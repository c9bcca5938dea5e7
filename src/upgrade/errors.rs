use crate::{
    be::{state::StateError, BeError},
    bootloader::BootloaderError,
    offline::OfflineError,
    pkgdb::PkgDbError,
    plan::PlanError,
};
use std::io;
use thiserror::Error;

pub type UpResult<T> = Result<T, UpgradeError>;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("package database negotiation failed")]
    PkgDb(#[from] PkgDbError),

    #[error("offline image handling failed")]
    Offline(#[from] OfflineError),

    #[error("boot environment operation failed")]
    Be(#[from] BeError),

    #[error("bootloader update failed")]
    Bootloader(#[from] BootloaderError),

    #[error("failed to classify the pending change set")]
    Classify(#[from] PlanError),

    #[error("no updates to install")]
    NoUpdates,

    #[error("failed to launch `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed draining the output of `{command}`")]
    Drain {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with failure:\n{tail}")]
    CommandFailed { command: String, tail: String },

    #[error("self-bootstrap of the {package} package failed")]
    Bootstrap {
        package: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to replace the live package database")]
    DbSwap(#[source] io::Error),

    #[error("failed reading the staged session state")]
    Handoff(#[from] StateError),

    #[error("failed to remount the root filesystem read-write")]
    RemountRoot(#[source] io::Error),
}
