/// Mesh transport seam.
///
/// The node core never manages links, retransmission or topology; it only
/// needs broadcast, directed send and the current neighbour set. Radio
/// adapters implement [`MeshTransport`] and call back into
/// [`crate::node::Node`] for received frames and disconnects.
///
/// [`PeerTable`] is the bookkeeping an adapter over a MAC-addressed link
/// (ESP-NOW) needs: numeric addresses derived from MACs, and silence-based
/// disconnect detection.
use core::fmt;

use heapless::Vec;

use crate::protocol::NodeAddress;

/// Maximum number of peers tracked by a transport adapter
pub const MAX_PEERS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Destination address is not a known peer
    NotConnected,
    /// Payload exceeds the link's frame size
    PayloadTooLarge,
    /// Outbound queue full; frame not accepted
    QueueFull,
    /// Radio driver reported a failure
    Radio,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportError::NotConnected => "peer not connected",
            TransportError::PayloadTooLarge => "payload too large",
            TransportError::QueueFull => "outbound queue full",
            TransportError::Radio => "radio failure",
        })
    }
}

/// Outbound side of the mesh as seen by the node core.
pub trait MeshTransport {
    /// Deliver `payload` to every connected peer.
    fn broadcast(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Deliver `payload` to a single peer.
    fn send_to(&mut self, to: NodeAddress, payload: &[u8]) -> Result<(), TransportError>;

    /// Addresses currently reachable.
    fn connected_addresses(&self) -> Vec<NodeAddress, MAX_PEERS>;
}

/// Derive the mesh address of a station from its MAC: the low four bytes,
/// big-endian.
pub fn address_from_mac(mac: &[u8; 6]) -> NodeAddress {
    NodeAddress(u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]))
}

#[derive(Debug, Clone, Copy)]
struct Peer {
    mac: [u8; 6],
    address: NodeAddress,
    last_heard: u64,
}

/// MAC ↔ address table with last-heard timestamps.
pub struct PeerTable {
    peers: Vec<Peer, MAX_PEERS>,
}

impl PeerTable {
    pub const fn new() -> Self {
        Self { peers: Vec::new() }
    }

    /// Record a frame heard from `mac` at `now` (ms). Returns the peer's
    /// address. When the table is full the quietest peer is replaced.
    pub fn note(&mut self, mac: &[u8; 6], now: u64) -> NodeAddress {
        let address = address_from_mac(mac);
        if let Some(peer) = self.peers.iter_mut().find(|p| p.mac == *mac) {
            peer.last_heard = now;
            return address;
        }

        let peer = Peer {
            mac: *mac,
            address,
            last_heard: now,
        };
        if let Err(peer) = self.peers.push(peer) {
            if let Some(idx) = self.quietest() {
                log::warn!(
                    "Peer table full, replacing {}",
                    self.peers[idx].address
                );
                self.peers[idx] = peer;
            }
        }
        address
    }

    /// MAC for a known address.
    pub fn mac_of(&self, address: NodeAddress) -> Option<[u8; 6]> {
        self.peers
            .iter()
            .find(|p| p.address == address)
            .map(|p| p.mac)
    }

    pub fn addresses(&self) -> Vec<NodeAddress, MAX_PEERS> {
        self.peers.iter().map(|p| p.address).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop peers silent for longer than `timeout_ms` and report them as
    /// disconnected. Each peer is reported once.
    pub fn reap(&mut self, now: u64, timeout_ms: u64) -> Vec<NodeAddress, MAX_PEERS> {
        let cutoff = now.saturating_sub(timeout_ms);
        let mut gone = Vec::new();
        self.peers.retain(|p| {
            if p.last_heard < cutoff {
                let _ = gone.push(p.address);
                false
            } else {
                true
            }
        });
        gone
    }

    fn quietest(&self) -> Option<usize> {
        self.peers
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.last_heard)
            .map(|(idx, _)| idx)
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: [u8; 6] = [0x24, 0x6F, 0x28, 0x01, 0x02, 0x03];
    const MAC_B: [u8; 6] = [0x24, 0x6F, 0x28, 0x0A, 0x0B, 0x0C];

    #[test]
    fn address_uses_low_four_mac_bytes() {
        assert_eq!(address_from_mac(&MAC_A), NodeAddress(0x2801_0203));
    }

    #[test]
    fn note_is_idempotent_and_refreshes() {
        let mut table = PeerTable::new();
        let a = table.note(&MAC_A, 0);
        assert_eq!(table.note(&MAC_A, 500), a);
        assert_eq!(table.len(), 1);
        assert_eq!(table.mac_of(a), Some(MAC_A));
    }

    #[test]
    fn unknown_address_has_no_mac() {
        let table = PeerTable::new();
        assert_eq!(table.mac_of(NodeAddress(7)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn reap_reports_silent_peers_once() {
        let mut table = PeerTable::new();
        let a = table.note(&MAC_A, 0);
        let b = table.note(&MAC_B, 9_000);

        let gone = table.reap(10_000, 5_000);
        assert_eq!(gone.as_slice(), &[a]);
        assert_eq!(table.addresses().as_slice(), &[b]);

        assert!(table.reap(10_000, 5_000).is_empty());
    }

    #[test]
    fn full_table_replaces_quietest_peer() {
        let mut table = PeerTable::new();
        for i in 0..MAX_PEERS as u8 {
            table.note(&[0, 0, 0, 0, 0, i], 100 + u64::from(i));
        }
        // MAC ending in 0 was heard first
        let first = address_from_mac(&[0, 0, 0, 0, 0, 0]);
        let newcomer = table.note(&[0, 0, 0, 0, 1, 0], 1_000);
        assert_eq!(table.len(), MAX_PEERS);
        assert!(table.mac_of(first).is_none());
        assert!(table.mac_of(newcomer).is_some());
    }
}
