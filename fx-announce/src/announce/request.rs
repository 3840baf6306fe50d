use derive_more::Display;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// The length in bytes of an info hash or peer id.
pub const ID_LEN: usize = 20;

/// The lifecycle event which is sent along with an announce.
///
/// The discriminant is the event code of the UDP tracker protocol.
#[repr(u32)]
#[derive(Debug, Display, Default, Copy, Clone, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// A regular, periodic announce.
    #[default]
    #[display("")]
    None = 0,
    #[display("completed")]
    Completed = 1,
    #[display("started")]
    Started = 2,
    #[display("stopped")]
    Stopped = 3,
}

impl AnnounceEvent {
    /// Returns the name of the event as expected by HTTP trackers.
    /// It returns [None] for [AnnounceEvent::None] as the parameter should be omitted.
    pub fn query_value(&self) -> Option<String> {
        match self {
            AnnounceEvent::None => None,
            _ => Some(self.to_string()),
        }
    }
}

/// The announce information of a torrent that should be shared with a tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceRequest {
    /// The info hash of the torrent
    pub info_hash: [u8; ID_LEN],
    /// The peer id of the client
    pub peer_id: [u8; ID_LEN],
    /// The port on which the client accepts incoming peer connections
    pub port: u16,
    /// The total number of bytes uploaded
    pub uploaded: u64,
    /// The total number of bytes downloaded
    pub downloaded: u64,
    /// The number of bytes remaining before the torrent is complete
    pub left: u64,
    /// The lifecycle event of the announce
    pub event: AnnounceEvent,
    /// The number of peers the client would like to receive
    pub num_want: u32,
}

/// The result of a successful announce.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceResult {
    /// The peer addresses returned by the tracker, in no particular order.
    pub peers: Vec<SocketAddr>,
    /// The interval requested by the tracker between announces.
    pub interval: Duration,
    /// The earliest moment at which the client should announce again.
    pub next_announce: Instant,
}

impl AnnounceResult {
    pub(crate) fn new(peers: Vec<SocketAddr>, interval_seconds: u32) -> Self {
        let interval = Duration::from_secs(interval_seconds as u64);

        Self {
            peers,
            interval,
            next_announce: Instant::now() + interval,
        }
    }
}
