//! Optional daemon configuration supplied by the system administrator.

use serde_derive::Deserialize;
use std::{fs, io::ErrorKind};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DaemonConfig {
    /// Where to keep downloaded packages and session state.
    #[serde(default)]
    pub cachedir: String,
    /// Default signing key for offline update images.
    #[serde(default)]
    pub offlineupdatekey: String,
    /// Overrides the package tool binary.
    #[serde(default)]
    pub pkgbin: String,
}

impl DaemonConfig {
    /// Loads `/usr/local/etc/snapup.json`. A missing file is the common
    /// case; a malformed one is reported and ignored.
    pub fn load() -> Self {
        match fs::read_to_string(crate::CONFIG_FILE) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(why) => {
                    warn!("ignoring malformed {}: {}", crate::CONFIG_FILE, why);
                    Self::default()
                }
            },
            Err(why) => {
                if why.kind() != ErrorKind::NotFound {
                    warn!("failed to read {}: {}", crate::CONFIG_FILE, why);
                }

                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config() {
        let config: DaemonConfig =
            serde_json::from_str(r#"{"cachedir": "/tank/up"}"#).unwrap();
        assert_eq!(config.cachedir, "/tank/up");
        assert!(config.pkgbin.is_empty());
    }
}
