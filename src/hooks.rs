//! Shared State and Hook Types
//!
//! Lifecycle states used by relays and devices, plus the late-bound hook
//! types installed on them before start.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;

use crate::relay::Relay;

/// Lifecycle state of a relay or device.
///
/// A relay only ever moves Closed -> Running -> Closed. The Closing state
/// belongs to devices and covers the drain window between `close()` being
/// called and the last relay finishing its close callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Closed = 0,
    Running = 1,
    Closing = 2,
}

impl Status {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Status::Running,
            2 => Status::Closing,
            _ => Status::Closed,
        }
    }

    pub(crate) fn raw(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Closed => write!(f, "closed"),
            Status::Running => write!(f, "running"),
            Status::Closing => write!(f, "closing"),
        }
    }
}

/// Which endpoint of a relay produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The accepted client side.
    Inbound,
    /// The dialed target side.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Decides whether an accepted connection may proceed to dialing the
/// target. Returning `false` drops the connection without a dial attempt.
pub type AdmissionHook = Arc<dyn Fn(&TcpStream) -> bool + Send + Sync>;

/// Rewrites or suppresses a chunk in flight. The returned buffer is what
/// gets forwarded; an empty buffer drops the chunk without closing the
/// relay.
pub type DataHook = Arc<dyn Fn(&Relay, Direction, &[u8]) -> Bytes + Send + Sync>;

/// Fired exactly once when a relay finishes closing.
pub type CloseHook = Arc<dyn Fn(&Relay) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_raw_round_trip() {
        for status in [Status::Closed, Status::Running, Status::Closing] {
            assert_eq!(Status::from_raw(status.raw()), status);
        }
    }

    #[test]
    fn test_unknown_raw_value_maps_to_closed() {
        assert_eq!(Status::from_raw(17), Status::Closed);
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::Running.to_string(), "running");
        assert_eq!(Direction::Inbound.to_string(), "inbound");
        assert_eq!(Direction::Outbound.to_string(), "outbound");
    }
}
