/// JSON wire formats exchanged over the mesh and the serial console.
///
/// Mesh payloads are single JSON objects. Serial console traffic is
/// newline-delimited JSON (NDJSON). Uses `heapless` types for
/// no_std/no-alloc operation.
use core::fmt;

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

/// Maximum length of a human-assigned node name
pub const MAX_NAME_LEN: usize = 16;

/// Human-readable node name, assigned at provisioning ("8", "RaedamNode8")
pub type NodeName = String<MAX_NAME_LEN>;

/// Maximum number of readings a telemetry packet can carry
pub const MAX_READINGS: usize = 8;

/// Numeric mesh address assigned by the transport.
///
/// Not stable across reboots or reconnects; only the [`NodeName`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(pub u32);

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved `type` value marking a directory announcement
pub const ANNOUNCE_TYPE: &str = "name";

/// Reserved `type` value marking a telemetry packet
pub const TELEMETRY_TYPE: &str = "telemetry";

/// Directory announcement: "this address currently owns this name".
///
/// Wire form: `{"type":"name","name":"8"}`
#[derive(Debug, Serialize, Deserialize)]
pub struct Announcement<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub name: &'a str,
}

/// One node's contribution to a telemetry packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingEntry {
    /// Name of the node that took the reading
    #[serde(rename = "n")]
    pub node: NodeName,
    /// Measured distance in centimeters (meaningless when `valid` is false)
    #[serde(rename = "cm")]
    pub distance_cm: f32,
    #[serde(rename = "v")]
    pub valid: bool,
    /// Raw echo duration in microseconds, 0 on timeout
    #[serde(rename = "e")]
    pub echo_us: u32,
    /// Occupancy derived from the node's last valid reading
    #[serde(rename = "o")]
    pub occupied: bool,
}

/// Readings accumulated along the forwarding chain, one entry per hop.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPacket {
    /// Node that emitted the packet on its current hop
    pub source: NodeName,
    /// Number of nodes that have added a reading
    pub hops: u8,
    pub readings: Vec<ReadingEntry, MAX_READINGS>,
}

impl TelemetryPacket {
    /// Start an empty packet. `hops` is 0 until a reading is appended.
    pub fn new(source: NodeName) -> Self {
        Self {
            source,
            hops: 0,
            readings: Vec::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.readings.is_full()
    }

    /// Look up the reading contributed by `node`, if any.
    pub fn reading_for(&self, node: &str) -> Option<&ReadingEntry> {
        self.readings.iter().find(|r| r.node.as_str() == node)
    }
}

/// Telemetry wire form (serialize side).
///
/// `{"type":"telemetry","src":"8","hops":2,"r":[{"n":"7","cm":53.2,"v":true,"e":3102,"o":true}]}`
/// Keys are kept short: ESP-NOW frames cap out at 250 bytes.
#[derive(Serialize)]
pub(crate) struct TelemetryOut<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "src")]
    pub source: &'a str,
    pub hops: u8,
    #[serde(rename = "r")]
    pub readings: &'a [ReadingEntry],
}

/// Telemetry wire form (deserialize side).
#[derive(Deserialize)]
pub(crate) struct TelemetryIn<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    #[serde(rename = "src")]
    pub source: NodeName,
    pub hops: u8,
    #[serde(rename = "r")]
    pub readings: Vec<ReadingEntry, MAX_READINGS>,
}

/// One row of the directory listing reported over serial
#[derive(Debug, Clone, Serialize)]
pub struct NodeListing {
    pub name: NodeName,
    pub addr: NodeAddress,
    /// Seconds since the last announcement from this node
    pub age: u32,
}

/// Messages sent from the node to the serial console
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// Node status report
    #[serde(rename = "status")]
    Status(&'a NodeStatus),
    /// Current directory contents
    #[serde(rename = "nodes")]
    Nodes { nodes: &'a [NodeListing] },
    /// Telemetry that reached the end of the chain on this node
    #[serde(rename = "telemetry")]
    Telemetry {
        #[serde(rename = "src")]
        source: &'a str,
        hops: u8,
        #[serde(rename = "r")]
        readings: &'a [ReadingEntry],
    },
    /// Acknowledgement or rejection of a host command
    #[serde(rename = "ack")]
    Ack {
        cmd: &'static str,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'static str>,
    },
}

/// Node status report, also the payload of [`DeviceMessage::Status`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: NodeName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<NodeName>,
    /// Uptime in seconds
    pub uptime: u32,
    /// Entries currently in the directory
    pub peers: u8,
    /// Transport-level links currently up
    pub links: u8,
    /// Whether the successor currently resolves to an address
    pub next_known: bool,
    pub occupied: bool,
    /// Last valid distance in centimeters, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_cm: Option<f32>,
    pub threshold_cm: u16,
    pub measurements: u32,
    pub errors: u32,
    pub sent: u32,
    pub dropped: u32,
    /// Board identifier
    pub board: &'static str,
    /// Firmware version
    pub version: &'static str,
}

/// Commands accepted on the serial console.
///
/// Parsed through [`RawCommand`]; `serde_json_core` cannot deserialize
/// tagged enums.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// Request current status
    GetStatus,
    /// Request the directory listing
    ListNodes,
    /// Update the occupancy threshold
    SetThreshold { cm: u16 },
    /// Assign a new announced name
    SetName { name: NodeName },
}

/// Flat console command as it appears on the wire, e.g.
/// `{"cmd":"set_threshold","cm":120}`. Mapped onto [`HostCommand`] by
/// `comm::parse_command()`.
#[derive(Deserialize)]
pub(crate) struct RawCommand<'a> {
    pub cmd: &'a str,
    #[serde(default)]
    pub cm: Option<u16>,
    #[serde(default, borrow)]
    pub name: Option<&'a str>,
}

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;

/// Largest payload a single mesh frame carries (ESP-NOW v1).
///
/// Telemetry is kept under this on every hop; a packet with one reading
/// always fits, whatever the name lengths.
pub const MAX_FRAME_LEN: usize = 250;

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::try_from(s).unwrap()
    }

    #[test]
    fn node_address_displays_as_decimal() {
        let mut s = String::<16>::new();
        core::fmt::write(&mut s, format_args!("{}", NodeAddress(3_735_928_559))).unwrap();
        assert_eq!(s.as_str(), "3735928559");
    }

    #[test]
    fn serialize_announcement() {
        let msg = Announcement {
            kind: ANNOUNCE_TYPE,
            name: "8",
        };
        let mut buf = [0u8; 64];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        assert_eq!(&buf[..len], br#"{"type":"name","name":"8"}"#);
    }

    #[test]
    fn serialize_status_message() {
        let status = NodeStatus {
            name: name("8"),
            next: Some(name("9")),
            uptime: 120,
            peers: 3,
            links: 2,
            next_known: true,
            occupied: false,
            distance_cm: None,
            threshold_cm: 100,
            measurements: 4,
            errors: 1,
            sent: 3,
            dropped: 0,
            board: "test_board",
            version: "0.1.0",
        };
        let msg = DeviceMessage::Status(&status);
        let mut buf = [0u8; 512];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""name":"8""#));
        assert!(json.contains(r#""next":"9""#));
        assert!(json.contains(r#""peers":3"#));
        assert!(json.contains(r#""board":"test_board""#));
        // distance omitted when no valid reading exists
        assert!(!json.contains("distance_cm"));
    }

    #[test]
    fn serialize_nodes_message() {
        let nodes = [
            NodeListing {
                name: name("7"),
                addr: NodeAddress(1001),
                age: 12,
            },
            NodeListing {
                name: name("9"),
                addr: NodeAddress(1002),
                age: 40,
            },
        ];
        let msg = DeviceMessage::Nodes { nodes: &nodes };
        let mut buf = [0u8; 256];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""type":"nodes""#));
        assert!(json.contains(r#"{"name":"7","addr":1001,"age":12}"#));
        assert!(json.contains(r#"{"name":"9","addr":1002,"age":40}"#));
    }

    #[test]
    fn serialize_ack_without_error_omits_field() {
        let msg = DeviceMessage::Ack {
            cmd: "set_threshold",
            ok: true,
            error: None,
        };
        let mut buf = [0u8; 128];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""cmd":"set_threshold""#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn packet_lookup_by_node() {
        let mut packet = TelemetryPacket::new(name("8"));
        packet
            .readings
            .push(ReadingEntry {
                node: name("7"),
                distance_cm: 50.0,
                valid: true,
                echo_us: 2915,
                occupied: true,
            })
            .unwrap();
        assert!(packet.reading_for("7").is_some());
        assert!(packet.reading_for("8").is_none());
        assert!(!packet.is_full());
    }

    #[test]
    fn version_has_three_numeric_parts() {
        let mut parts = 0;
        for part in VERSION.split('.') {
            assert!(part.parse::<u32>().is_ok(), "bad version part '{part}'");
            parts += 1;
        }
        assert_eq!(parts, 3);
    }
}
