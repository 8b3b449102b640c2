/// Telemetry forwarding along the statically configured chain.
///
/// Each node appends its own reading to whatever its predecessor sent and
/// passes the packet to its successor, addressed by name and resolved
/// through the directory at send time. There is no retry queue here: a
/// packet that cannot be sent is dropped and counted, and forwarding resumes
/// once the successor is heard again.
use core::fmt;

use crate::comm;
use crate::directory::NodeDirectory;
use crate::protocol::{
    MsgBuffer, NodeAddress, NodeName, ReadingEntry, TelemetryPacket, MAX_FRAME_LEN,
};
use crate::sensor::SensorReading;
use crate::transport::{MeshTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError {
    /// Successor name not in the directory
    UnknownSuccessor,
    /// Packet did not fit the message buffer
    Encode,
    Transport(TransportError),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::UnknownSuccessor => f.write_str("successor not in directory"),
            ForwardError::Encode => f.write_str("telemetry encoding failed"),
            ForwardError::Transport(e) => write!(f, "telemetry send failed: {}", e),
        }
    }
}

impl From<TransportError> for ForwardError {
    fn from(e: TransportError) -> Self {
        ForwardError::Transport(e)
    }
}

pub struct TelemetryForwarder {
    self_name: NodeName,
    successor: Option<NodeName>,
    max_hops: u8,
    sent: u32,
    dropped: u32,
}

/// Whether `packet` encodes within one mesh frame.
fn fits_frame(packet: &TelemetryPacket) -> bool {
    let mut buf = MsgBuffer::new();
    comm::encode_telemetry(packet, &mut buf).is_some_and(|len| len <= MAX_FRAME_LEN)
}

impl TelemetryForwarder {
    pub fn new(self_name: NodeName, successor: Option<NodeName>, max_hops: u8) -> Self {
        Self {
            self_name,
            successor,
            max_hops,
            sent: 0,
            dropped: 0,
        }
    }

    /// Append this node's reading to `upstream`, or start a fresh packet.
    ///
    /// An upstream packet already at the hop cap (or out of reading slots)
    /// is discarded so a directory cycle cannot grow packets without bound.
    /// So is one that would no longer fit a [`MAX_FRAME_LEN`] mesh frame
    /// with this node's reading added. Either way this node's own reading
    /// still goes out in a fresh packet.
    pub fn build_outgoing(
        &mut self,
        reading: &SensorReading,
        occupied: bool,
        upstream: Option<TelemetryPacket>,
    ) -> TelemetryPacket {
        let entry = ReadingEntry {
            node: self.self_name.clone(),
            distance_cm: reading.distance_cm,
            valid: reading.valid,
            echo_us: reading.echo_us,
            occupied,
        };

        let mut packet = match upstream {
            Some(p) if p.hops >= self.max_hops || p.is_full() => {
                log::warn!(
                    "Dropping upstream packet from '{}' at {} hops",
                    p.source,
                    p.hops
                );
                self.dropped = self.dropped.wrapping_add(1);
                return self.fresh(entry);
            }
            Some(p) => p,
            None => return self.fresh(entry),
        };

        let upstream_source = core::mem::replace(&mut packet.source, self.self_name.clone());
        let upstream_hops = packet.hops;
        // Capacity checked above.
        let _ = packet.readings.push(entry.clone());
        packet.hops = packet.hops.saturating_add(1);

        if !fits_frame(&packet) {
            log::warn!(
                "Dropping upstream packet from '{}' at {} hops, frame would exceed {} bytes",
                upstream_source,
                upstream_hops,
                MAX_FRAME_LEN
            );
            self.dropped = self.dropped.wrapping_add(1);
            return self.fresh(entry);
        }
        packet
    }

    fn fresh(&self, entry: ReadingEntry) -> TelemetryPacket {
        let mut packet = TelemetryPacket::new(self.self_name.clone());
        // An empty packet always has room for one reading.
        let _ = packet.readings.push(entry);
        packet.hops = 1;
        packet
    }

    /// Send `packet` to the successor's current address.
    ///
    /// Fails with [`ForwardError::UnknownSuccessor`] without touching the
    /// transport when the successor has not been heard. Every failure drops
    /// the packet.
    pub fn send<T: MeshTransport>(
        &mut self,
        packet: &TelemetryPacket,
        directory: &NodeDirectory,
        transport: &mut T,
    ) -> Result<NodeAddress, ForwardError> {
        let result = self.try_send(packet, directory, transport);
        match result {
            Ok(to) => {
                self.sent = self.sent.wrapping_add(1);
                log::info!(
                    "Forwarded {} reading(s) to '{}' ({})",
                    packet.readings.len(),
                    self.successor.as_deref().unwrap_or(""),
                    to
                );
            }
            Err(e) => {
                self.dropped = self.dropped.wrapping_add(1);
                log::warn!("Telemetry dropped: {}", e);
            }
        }
        result
    }

    fn try_send<T: MeshTransport>(
        &self,
        packet: &TelemetryPacket,
        directory: &NodeDirectory,
        transport: &mut T,
    ) -> Result<NodeAddress, ForwardError> {
        let to = self
            .successor
            .as_deref()
            .and_then(|next| directory.resolve(next))
            .ok_or(ForwardError::UnknownSuccessor)?;

        let mut buf = MsgBuffer::new();
        comm::encode_telemetry(packet, &mut buf).ok_or(ForwardError::Encode)?;
        transport.send_to(to, &buf)?;
        Ok(to)
    }

    /// Whether this node ends the chain.
    pub fn is_sink(&self) -> bool {
        self.successor.is_none()
    }

    pub fn successor(&self) -> Option<&NodeName> {
        self.successor.as_ref()
    }

    pub fn set_self_name(&mut self, name: NodeName) {
        self.self_name = name;
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}
