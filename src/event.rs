use std::fmt;
use std::str::FromStr;

bitflags::bitflags! {
    /// Readiness event bitset exchanged with the poll backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Event: u32 {
        /// The fd is readable (or a listener has pending connections).
        const READ = 1 << 0;
        /// The fd is writable.
        const WRITE = 1 << 1;
        /// The fd is in an error or hangup state. Always reported, never
        /// requested; takes precedence over READ/WRITE during dispatch.
        const ERROR = 1 << 2;
    }
}

/// Poll backend selection.
///
/// `None` picks the best backend available on the target OS. Requesting a
/// backend the OS does not provide makes loop construction fail with
/// `Error::NotSupported`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollType {
    /// Automatically select the best available backend.
    #[default]
    None,
    /// poll(2). Available on all unix targets.
    Poll,
    /// select(2). Available on all unix targets, fd values bounded by
    /// FD_SETSIZE.
    Select,
    /// epoll(7). Linux only.
    Epoll,
    /// kqueue(2). macOS and the BSDs.
    Kqueue,
    /// I/O completion ports. Not implemented on unix builds.
    Iocp,
}

impl fmt::Display for PollType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollType::None => write!(f, "auto"),
            PollType::Poll => write!(f, "poll"),
            PollType::Select => write!(f, "select"),
            PollType::Epoll => write!(f, "epoll"),
            PollType::Kqueue => write!(f, "kqueue"),
            PollType::Iocp => write!(f, "iocp"),
        }
    }
}

impl FromStr for PollType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "none" => Ok(PollType::None),
            "poll" => Ok(PollType::Poll),
            "select" => Ok(PollType::Select),
            "epoll" => Ok(PollType::Epoll),
            "kqueue" => Ok(PollType::Kqueue),
            "iocp" => Ok(PollType::Iocp),
            _ => Err(format!("unknown poll type: {s}")),
        }
    }
}
