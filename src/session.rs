//! All mutable state of one upgrade session, threaded explicitly through
//! every operation. At most one session is active per daemon; the daemon's
//! status flag enforces that before a session is ever constructed.

use crate::{config::DaemonConfig, offline::OfflineImage, protocol::UpdateRequest};
use std::path::PathBuf;
use tokio::process::Command;

/// Filesystem layout of the session's working state. A cache-dir override
/// from the request re-roots every path.
#[derive(Clone, Debug)]
pub struct Layout {
    pub state_root: PathBuf,
    pub pkg_db: PathBuf,
    pub pkg_conf: PathBuf,
    pub img_mnt: PathBuf,
    pub cache_dir: PathBuf,
}

impl Layout {
    pub fn new(cache_override: &str) -> Self {
        let state_root = if cache_override.is_empty() {
            PathBuf::from(crate::STATE_DIR)
        } else {
            PathBuf::from(cache_override)
        };

        Self {
            pkg_db: state_root.join("pkgdb"),
            pkg_conf: state_root.join("pkg.conf"),
            img_mnt: state_root.join("mnt"),
            cache_dir: state_root.join("cache"),
            state_root,
        }
    }
}

impl Default for Layout {
    fn default() -> Self { Self::new("") }
}

pub struct Session {
    pub request: UpdateRequest,
    pub layout: Layout,
    pub pkg_bin: String,
    /// Corrected architecture token negotiated after an ABI mismatch.
    pub abi_override: Option<String>,
    /// Repository descriptor fragment synthesized for an offline image.
    pub repos_fragment: Option<String>,
    /// Human name of the package owning the booted kernel.
    pub kernel_pkg: Option<String>,
    pub offline: OfflineImage,
}

impl Session {
    pub fn new(mut request: UpdateRequest, config: &DaemonConfig, offline: OfflineImage) -> Self {
        // The config file only fills fields the request left open.
        if request.cachedir.is_empty() {
            request.cachedir = config.cachedir.clone();
        }

        if request.updatekey.is_empty() {
            request.updatekey = config.offlineupdatekey.clone();
        }

        let layout = Layout::new(&request.cachedir);

        let pkg_bin = if config.pkgbin.is_empty() {
            crate::PKG_BIN.to_owned()
        } else {
            config.pkgbin.clone()
        };

        Self {
            request,
            layout,
            pkg_bin,
            abi_override: None,
            repos_fragment: None,
            kernel_pkg: None,
            offline,
        }
    }

    /// Bare package tool invocation against the live system.
    pub fn pkg(&self) -> Command { Command::new(&self.pkg_bin) }

    /// Package tool invocation using the session's negotiated configuration.
    pub fn pkg_conf(&self) -> Command {
        cascade! {
            self.pkg();
            ..arg("-C");
            ..arg(&self.layout.pkg_conf);
        }
    }

    /// Package tool invocation rooted in the staging boot environment. The
    /// configuration path is resolved inside the stage, which is why the
    /// stage carries its own copy of the file.
    pub fn pkg_staged(&self) -> Command {
        cascade! {
            self.pkg();
            ..args(&["-c", crate::STAGE_DIR]);
            ..arg("-C");
            ..arg(&self.layout.pkg_conf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout() {
        let layout = Layout::new("");
        assert_eq!(layout.pkg_db, PathBuf::from(crate::PKG_DB));
        assert_eq!(layout.pkg_conf, PathBuf::from(crate::PKG_CONF));
        assert_eq!(layout.img_mnt, PathBuf::from(crate::IMG_MNT));
        assert_eq!(layout.cache_dir, PathBuf::from(crate::CACHE_DIR));
    }

    #[test]
    fn rerooted_layout() {
        let layout = Layout::new("/tank/scratch");
        assert_eq!(layout.state_root, PathBuf::from("/tank/scratch"));
        assert_eq!(layout.img_mnt, PathBuf::from("/tank/scratch/mnt"));
    }

    #[test]
    fn config_fills_open_fields() {
        let config = DaemonConfig {
            cachedir: "/tank/scratch".into(),
            offlineupdatekey: "/etc/keys/update.pub".into(),
            pkgbin: String::new(),
        };

        let session =
            Session::new(UpdateRequest::default(), &config, OfflineImage::default());

        assert_eq!(session.layout.state_root, PathBuf::from("/tank/scratch"));
        assert_eq!(session.request.updatekey, "/etc/keys/update.pub");
        assert_eq!(session.pkg_bin, crate::PKG_BIN);
    }

    #[test]
    fn request_wins_over_config() {
        let config = DaemonConfig { cachedir: "/tank/scratch".into(), ..Default::default() };
        let request = UpdateRequest { cachedir: "/var/tmp/up".into(), ..Default::default() };

        let session = Session::new(request, &config, OfflineImage::default());
        assert_eq!(session.layout.state_root, PathBuf::from("/var/tmp/up"));
    }
}
