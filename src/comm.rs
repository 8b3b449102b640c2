/// Wire encoding helpers for mesh payloads and the serial console.
///
/// Mesh payloads are compact JSON objects distinguished by their `type`
/// field. The serial console streams newline-delimited JSON device messages
/// and accepts NDJSON host commands.
use heapless::Vec;
use serde::Serialize;

use crate::protocol::{
    Announcement, DeviceMessage, HostCommand, MsgBuffer, NodeName, RawCommand, TelemetryIn,
    TelemetryOut, TelemetryPacket, ANNOUNCE_TYPE, MAX_MSG_LEN, TELEMETRY_TYPE,
};

/// Serial baud rate
pub const SERIAL_BAUD: u32 = 115200;

/// Longest console command line accepted
pub const MAX_LINE_LEN: usize = 128;

/// Serialize `value` into `out`, replacing its contents.
fn encode_into<T: Serialize>(value: &T, out: &mut MsgBuffer) -> Option<usize> {
    out.clear();
    out.resize_default(MAX_MSG_LEN).ok()?;
    match serde_json_core::to_slice(value, out) {
        Ok(len) => {
            out.truncate(len);
            Some(len)
        }
        Err(_) => {
            out.clear();
            None
        }
    }
}

/// Encode a device message as one NDJSON line, newline included.
pub fn encode_device_message(msg: &DeviceMessage, out: &mut MsgBuffer) -> Option<usize> {
    encode_into(msg, out)?;
    if out.push(b'\n').is_err() {
        out.clear();
        return None;
    }
    Some(out.len())
}

/// Encode this node's name claim: `{"type":"name","name":"8"}`.
pub fn encode_announcement(name: &str, out: &mut MsgBuffer) -> Option<usize> {
    let msg = Announcement {
        kind: ANNOUNCE_TYPE,
        name,
    };
    encode_into(&msg, out)
}

/// Recognise a directory announcement and return the claimed name.
///
/// `None` means the payload is not a directory message at all, which is
/// the normal case for telemetry. The returned name is unchecked and may be
/// empty or longer than a [`NodeName`].
pub fn decode_announcement(payload: &[u8]) -> Option<&str> {
    let (msg, _) = serde_json_core::from_slice::<Announcement>(payload).ok()?;
    (msg.kind == ANNOUNCE_TYPE).then_some(msg.name)
}

/// Encode a telemetry packet for the mesh.
pub fn encode_telemetry(packet: &TelemetryPacket, out: &mut MsgBuffer) -> Option<usize> {
    let msg = TelemetryOut {
        kind: TELEMETRY_TYPE,
        source: &packet.source,
        hops: packet.hops,
        readings: &packet.readings,
    };
    encode_into(&msg, out)
}

/// Decode a telemetry packet received from the mesh.
pub fn decode_telemetry(payload: &[u8]) -> Option<TelemetryPacket> {
    let (msg, _) = serde_json_core::from_slice::<TelemetryIn>(payload).ok()?;
    if msg.kind != TELEMETRY_TYPE {
        return None;
    }
    Some(TelemetryPacket {
        source: msg.source,
        hops: msg.hops,
        readings: msg.readings,
    })
}

/// Deserialize a HostCommand from a JSON byte slice.
pub fn parse_command(data: &[u8]) -> Option<HostCommand> {
    // Strip trailing newline/whitespace
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return None;
    }
    let (raw, _) = serde_json_core::from_slice::<RawCommand>(trimmed).ok()?;
    match raw.cmd {
        "status" => Some(HostCommand::GetStatus),
        "nodes" => Some(HostCommand::ListNodes),
        "set_threshold" => raw.cm.map(|cm| HostCommand::SetThreshold { cm }),
        "set_name" => {
            let name = NodeName::try_from(raw.name?).ok()?;
            Some(HostCommand::SetName { name })
        }
        _ => None,
    }
}

// ── Console line reader ─────────────────────────────────────────────

/// Splits the console byte stream into lines.
///
/// A line longer than [`MAX_LINE_LEN`] is discarded up to its terminator,
/// so its tail is never mistaken for a command.
pub struct LineReader {
    line: Vec<u8, MAX_LINE_LEN>,
    /// Last call yielded `line`; clear it before the next byte
    yielded: bool,
    overflowed: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            line: Vec::new(),
            yielded: false,
            overflowed: false,
        }
    }

    /// Feed one byte. Returns the completed line, without its terminator,
    /// when `byte` ends a non-empty line.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if self.yielded {
            self.line.clear();
            self.yielded = false;
        }

        match byte {
            b'\n' | b'\r' => {
                if self.overflowed {
                    self.overflowed = false;
                    self.line.clear();
                    return None;
                }
                if self.line.is_empty() {
                    return None;
                }
                self.yielded = true;
                Some(self.line.as_slice())
            }
            _ if self.overflowed => None,
            _ => {
                if self.line.push(byte).is_err() {
                    log::warn!("Console line over {} bytes discarded", MAX_LINE_LEN);
                    self.overflowed = true;
                    self.line.clear();
                }
                None
            }
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && matches!(data[end - 1], b' ' | b'\n' | b'\r' | b'\t') {
        end -= 1;
    }
    &data[..end]
}
