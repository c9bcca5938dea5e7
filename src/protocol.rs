//! The JSON envelopes exchanged with clients.
//!
//! Every message on the control socket is a single JSON object per line with
//! a `method` discriminator. Transport framing stops there; everything else
//! the daemon and client exchange is described by these two enums.

use crate::plan::UpdatePlan;
use serde_derive::{Deserialize, Serialize};

/// Parameters of one upgrade session, fixed at request time.
///
/// Empty strings mean "not supplied", matching what a client omits from the
/// JSON object.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub fullupdate: bool,
    #[serde(default)]
    pub cachedir: String,
    #[serde(default)]
    pub bename: String,
    #[serde(default)]
    pub disablebs: bool,
    #[serde(default)]
    pub updatefile: String,
    #[serde(default)]
    pub updatekey: String,
    #[serde(default)]
    pub fetchonly: bool,
}

impl UpdateRequest {
    pub fn offline_image(&self) -> Option<&str> {
        if self.updatefile.is_empty() {
            None
        } else {
            Some(&self.updatefile)
        }
    }
}

/// Inbound request envelope.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Request {
    Check,
    Update(UpdateRequest),
}

/// Outbound event envelope.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Message {
    /// Free-text progress line.
    Info { info: String },
    /// Terminal error; the session is over and nothing was activated.
    Fatal { info: String },
    /// Session complete; the client may disconnect.
    Shutdown { info: String },
    /// Reply to a `check` request.
    Check { updates: bool, details: UpdatePlan },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_roundtrip() {
        let raw = r#"{"method":"update","bename":"13.1-RELEASE","fullupdate":true}"#;
        let request = serde_json::from_str::<Request>(raw).unwrap();

        match request {
            Request::Update(req) => {
                assert!(req.fullupdate);
                assert_eq!(req.bename, "13.1-RELEASE");
                assert!(req.updatefile.is_empty());
                assert!(!req.fetchonly);
            }
            other => panic!("parsed the wrong method: {:?}", other),
        }
    }

    #[test]
    fn check_request() {
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"method":"check"}"#).unwrap(),
            Request::Check
        );
    }

    #[test]
    fn info_envelope() {
        let message = Message::Info { info: "Creating new boot environment".into() };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"method":"info","info":"Creating new boot environment"}"#
        );
    }

    #[test]
    fn offline_image_accessor() {
        let mut req = UpdateRequest::default();
        assert_eq!(req.offline_image(), None);

        req.updatefile = "/tmp/update.img".into();
        assert_eq!(req.offline_image(), Some("/tmp/update.img"));
    }
}
