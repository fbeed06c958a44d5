use serde::Serialize;

use crate::serde_utils::quoted_u64;
use crate::sync::SyncPeer;

/// Peer pool summary.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerCount {
    #[serde(with = "quoted_u64")]
    pub connected: u64,
    /// Peers that have sent a status.
    #[serde(with = "quoted_u64")]
    pub with_status: u64,
    /// Peers at the request concurrency limit.
    #[serde(with = "quoted_u64")]
    pub saturated: u64,
}

impl PeerCount {
    pub fn new<'a>(peers: impl IntoIterator<Item = &'a SyncPeer>) -> Self {
        let mut count = PeerCount::default();
        for peer in peers {
            count.connected += 1;
            if peer.has_status() {
                count.with_status += 1;
            }
            if !peer.is_available() {
                count.saturated += 1;
            }
        }
        count
    }
}
