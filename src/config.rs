/// Provisioning constants and the immutable per-node configuration.
///
/// Device and successor names are baked in at build time through the
/// `RAEDAM_NODE_NAME` / `RAEDAM_NEXT_NODE` environment variables. An empty
/// `RAEDAM_NEXT_NODE` provisions the node as the chain tail (sink).
use core::fmt;

use crate::protocol::{NodeName, MAX_READINGS};

/// Name announced by this device
pub const DEVICE_NAME: &str = match option_env!("RAEDAM_NODE_NAME") {
    Some(name) => name,
    None => "8",
};

/// Name of the node telemetry is forwarded to; empty for the sink
pub const NEXT_NODE: &str = match option_env!("RAEDAM_NEXT_NODE") {
    Some(name) => name,
    None => "9",
};

/// Shortest distance the HC-SR04 reports reliably; below this is self-noise
pub const MIN_DISTANCE_CM: u16 = 2;

/// Rated maximum range of HC-SR04 class sensors
pub const MAX_DISTANCE_CM: u16 = 400;

/// Default occupancy threshold: a car parked over the sensor
pub const DEFAULT_OCCUPIED_DISTANCE_CM: u16 = 100;

/// Name announcement period
pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u32 = 60_000;

/// Measurement/forward period (15 minutes)
pub const DEFAULT_MEASURE_INTERVAL_MS: u32 = 900_000;

/// Directory entries not refreshed within this many announcement periods expire
pub const ENTRY_MAX_AGE_INTERVALS: u32 = 3;

/// Default hop cap. Guards against forwarding loops; frame size is bounded
/// separately by `MAX_FRAME_LEN`.
pub const DEFAULT_MAX_HOPS: u8 = MAX_READINGS as u8;

/// Rejected configuration values. The previous value is always kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Occupancy threshold outside `[MIN_DISTANCE_CM, MAX_DISTANCE_CM]`
    ThresholdOutOfRange(u16),
    /// Node name is empty
    EmptyName,
    /// Node name longer than `MAX_NAME_LEN`
    NameTooLong,
    /// A periodic interval is zero
    ZeroInterval,
    /// Hop cap is zero or above the packet capacity
    MaxHopsOutOfRange(u8),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ThresholdOutOfRange(cm) => write!(
                f,
                "occupancy threshold {} cm outside {}-{} cm",
                cm, MIN_DISTANCE_CM, MAX_DISTANCE_CM
            ),
            ConfigError::EmptyName => f.write_str("node name is empty"),
            ConfigError::NameTooLong => f.write_str("node name too long"),
            ConfigError::ZeroInterval => f.write_str("interval must be non-zero"),
            ConfigError::MaxHopsOutOfRange(n) => {
                write!(f, "max hops {} outside 1-{}", n, MAX_READINGS)
            }
        }
    }
}

/// Parse a node name, rejecting empty and over-long names.
pub fn node_name(name: &str) -> Result<NodeName, ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::EmptyName);
    }
    NodeName::try_from(name).map_err(|_| ConfigError::NameTooLong)
}

/// Check an occupancy threshold against the sensor's rated range.
pub fn check_threshold(cm: u16) -> Result<u16, ConfigError> {
    if (MIN_DISTANCE_CM..=MAX_DISTANCE_CM).contains(&cm) {
        Ok(cm)
    } else {
        Err(ConfigError::ThresholdOutOfRange(cm))
    }
}

/// Immutable configuration handed to [`crate::node::Node`] at construction.
///
/// Separate instances can coexist (one per simulated node in tests).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Name this node announces; may be left empty and assigned later
    pub name: NodeName,
    /// Next node in the forwarding chain; `None` for the sink
    pub successor: Option<NodeName>,
    pub occupied_threshold_cm: u16,
    pub announce_interval_ms: u32,
    pub measure_interval_ms: u32,
    /// Directory entries older than this are purged
    pub entry_max_age_ms: u32,
    /// A name held by another address refreshed within this window
    /// cannot be taken over. 0 = latest claim always wins.
    pub name_grace_ms: u32,
    pub max_hops: u8,
}

impl NodeConfig {
    /// Configuration with default timing for `name` forwarding to `successor`.
    pub fn new(name: &str, successor: Option<&str>) -> Result<Self, ConfigError> {
        let name = if name.is_empty() {
            NodeName::new()
        } else {
            node_name(name)?
        };
        let successor = match successor {
            Some(next) if !next.is_empty() => Some(node_name(next)?),
            _ => None,
        };
        Ok(Self {
            name,
            successor,
            occupied_threshold_cm: DEFAULT_OCCUPIED_DISTANCE_CM,
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
            measure_interval_ms: DEFAULT_MEASURE_INTERVAL_MS,
            entry_max_age_ms: DEFAULT_ANNOUNCE_INTERVAL_MS * ENTRY_MAX_AGE_INTERVALS,
            name_grace_ms: 0,
            max_hops: DEFAULT_MAX_HOPS,
        })
    }

    /// Configuration from the compiled-in provisioning constants.
    pub fn provisioned() -> Result<Self, ConfigError> {
        Self::new(DEVICE_NAME, Some(NEXT_NODE))
    }

    pub fn with_threshold(mut self, cm: u16) -> Self {
        self.occupied_threshold_cm = cm;
        self
    }

    /// Set the announcement period; entry expiry follows at
    /// `ENTRY_MAX_AGE_INTERVALS` periods.
    pub fn with_announce_interval(mut self, ms: u32) -> Self {
        self.announce_interval_ms = ms;
        self.entry_max_age_ms = ms.saturating_mul(ENTRY_MAX_AGE_INTERVALS);
        self
    }

    pub fn with_measure_interval(mut self, ms: u32) -> Self {
        self.measure_interval_ms = ms;
        self
    }

    pub fn with_entry_max_age(mut self, ms: u32) -> Self {
        self.entry_max_age_ms = ms;
        self
    }

    pub fn with_name_grace(mut self, ms: u32) -> Self {
        self.name_grace_ms = ms;
        self
    }

    pub fn with_max_hops(mut self, hops: u8) -> Self {
        self.max_hops = hops;
        self
    }

    /// Whether this node ends the forwarding chain.
    pub fn is_sink(&self) -> bool {
        self.successor.is_none()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_threshold(self.occupied_threshold_cm)?;
        if self.announce_interval_ms == 0
            || self.measure_interval_ms == 0
            || self.entry_max_age_ms == 0
        {
            return Err(ConfigError::ZeroInterval);
        }
        if self.max_hops == 0 || usize::from(self.max_hops) > MAX_READINGS {
            return Err(ConfigError::MaxHopsOutOfRange(self.max_hops));
        }
        if matches!(&self.successor, Some(next) if next.is_empty()) {
            return Err(ConfigError::EmptyName);
        }
        Ok(())
    }
}
