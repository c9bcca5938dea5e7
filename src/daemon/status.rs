use std::fmt::{self, Display, Formatter};

/// What the daemon is currently occupied with. Guards the single-session
/// invariant: a second request is refused while a session holds this.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DaemonStatus {
    Inactive = 0,
    Checking = 1,
    Updating = 2,
}

impl From<DaemonStatus> for &'static str {
    fn from(status: DaemonStatus) -> Self {
        match status {
            DaemonStatus::Inactive => "inactive",
            DaemonStatus::Checking => "checking for updates",
            DaemonStatus::Updating => "performing an update",
        }
    }
}

impl Display for DaemonStatus {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        fmt.write_str(<&'static str>::from(*self))
    }
}
