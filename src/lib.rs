#![deny(clippy::all)]

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate cascade;

#[macro_use]
extern crate enclose;

#[macro_use]
extern crate fomat_macros;

#[macro_use]
extern crate log;

/// Boot environment lifecycle: stage creation, rename/activate, teardown
pub mod be;

/// Rewrites boot code on every disk backing the active pool
pub mod bootloader;

/// Self-bootstrap: upgrade our own package and hand the session off
pub mod bootstrap;

/// Features specific to the upgrade client
pub mod client;

/// Optional daemon configuration file
pub mod config;

/// Features specific to the upgrade daemon
pub mod daemon;

/// Progress event reporting to connected clients
pub mod events;

/// Runs the package upgrade inside the stage, or live after reboot
pub mod executor;

/// Miscellaneous functions used throughout the library.
pub mod misc;

/// Attaches and mounts offline update images
pub mod offline;

/// Package database negotiation against the remote repository
pub mod pkgdb;

/// Dry-run parsing and kernel/ABI classification
pub mod plan;

/// Request and event envelopes exchanged with clients
pub mod protocol;

/// Per-session state threaded through every operation
pub mod session;

/// The session log written for post-mortem debugging
pub mod session_log;

/// Signal-handling capabilities for the daemon.
pub mod sighandler;

/// Post-reboot finalization of a staged upgrade
pub mod stage2;

/// The stage-1 upgrade orchestrator
pub mod upgrade;

use const_format::concatcp;

/// The package this tool ships as; seeing it in an upgrade plan triggers
/// the self-bootstrap hand-off.
pub const SELF_PACKAGE: &str = "snapup";

/// Default root for all mutable state. A cache-dir override re-roots it.
pub const STATE_DIR: &str = "/var/db/snapup";

pub const PKG_DB: &str = concatcp!(STATE_DIR, "/pkgdb");
pub const PKG_CONF: &str = concatcp!(STATE_DIR, "/pkg.conf");
pub const IMG_MNT: &str = concatcp!(STATE_DIR, "/mnt");
pub const CACHE_DIR: &str = concatcp!(STATE_DIR, "/cache");

pub const LOG_FILE: &str = "/var/log/snapup.log";
pub const CONFIG_FILE: &str = "/usr/local/etc/snapup.json";

/// Name of the disposable boot environment used while assembling an upgrade.
pub const BE_STAGE: &str = "snapup-stage";

/// Mount point of the staging boot environment.
pub const STAGE_DIR: &str = "/.snapup-stage";

pub const PKG_BIN: &str = "pkg-static";
pub const BE_BIN: &str = "beadm";

/// Marker file inside a boot environment naming the OS build; used to derive
/// the final name of an upgraded boot environment.
pub const VERSION_MARKER: &str = "etc/version";

/// Packages which must never fall out of an upgraded system; they are marked
/// non-automatic after every successful upgrade pass.
pub const CRITICAL_PACKAGES: &[&str] = &["ports-mgmt/pkg", "os/userland", "os/kernel"];

/// Kernel modules loaded best-effort before the stage-2 live upgrade, since
/// the freshly booted environment may not have processed its module list yet.
pub const COMPAT_KMODS: &[&str] = &["fdescfs", "linprocfs", "tmpfs"];

pub const DEFAULT_ADDR: &str = "127.0.0.1:8634";
