/// Node composition root.
///
/// Owns the sensor, directory, announcer, router and forwarder of one mesh
/// node and drives them from three entry points the host calls:
/// [`Node::on_timer_tick`] for periodic work, [`Node::on_receive`] for every
/// frame the transport delivers and [`Node::on_disconnect`] when the
/// transport loses a peer. All three run to completion on the caller's
/// context, so nothing here needs a lock.
use crate::announcer::DirectoryAnnouncer;
use crate::board;
use crate::comm;
use crate::config::{self, ConfigError, NodeConfig};
use crate::directory::NodeDirectory;
use crate::forwarder::{ForwardError, TelemetryForwarder};
use crate::protocol::{
    DeviceMessage, HostCommand, MsgBuffer, NodeAddress, NodeName, NodeStatus, TelemetryPacket,
    VERSION,
};
use crate::router::{MessageRouter, ReceiveHandler, Routed};
use crate::sensor::{EchoProbe, RangeSensor, SensorError, SensorReading};
use crate::transport::MeshTransport;

/// Fate of the packet assembled on a measurement tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Forwarded {
    /// Sent to the successor at this address
    Sent(NodeAddress),
    /// This node ends the chain; the packet is for the uplink
    Sink(TelemetryPacket),
    /// Dropped; forwarding resumes on the next tick
    Dropped(ForwardError),
    /// No name assigned yet, nothing forwarded
    Unnamed,
}

/// What one call to [`Node::on_timer_tick`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub announced: bool,
    /// Directory entries purged as stale
    pub expired: usize,
    /// Set on measurement ticks
    pub measured: Option<Result<SensorReading, SensorError>>,
    pub forwarded: Option<Forwarded>,
}

pub struct Node<T, P, H> {
    config: NodeConfig,
    transport: T,
    sensor: RangeSensor<P>,
    directory: NodeDirectory,
    announcer: DirectoryAnnouncer,
    router: MessageRouter<H>,
    forwarder: TelemetryForwarder,
    /// Latest packet received from the predecessor, not yet forwarded
    upstream: Option<TelemetryPacket>,
    next_measure: Option<u64>,
}

impl<T, P, H> Node<T, P, H>
where
    T: MeshTransport,
    P: EchoProbe,
    H: ReceiveHandler,
{
    pub fn new(config: NodeConfig, transport: T, probe: P, handler: H) -> Result<Self, ConfigError> {
        config.validate()?;
        let sensor = RangeSensor::new(probe, config.occupied_threshold_cm)?;
        let forwarder = TelemetryForwarder::new(
            config.name.clone(),
            config.successor.clone(),
            config.max_hops,
        );

        match &config.successor {
            Some(next) => log::info!("Node '{}' forwarding to '{}'", config.name, next),
            None => log::info!("Node '{}' is the chain sink", config.name),
        }

        Ok(Self {
            directory: NodeDirectory::new(u64::from(config.name_grace_ms)),
            announcer: DirectoryAnnouncer::new(u64::from(config.announce_interval_ms)),
            router: MessageRouter::new(handler),
            transport,
            sensor,
            forwarder,
            upstream: None,
            next_measure: None,
            config,
        })
    }

    /// Periodic work: directory expiry, name announcement and, when due,
    /// measure-and-forward. The first measurement comes one measurement
    /// interval after the first tick, giving the directory time to fill.
    pub fn on_timer_tick(&mut self, now: u64) -> TickReport {
        let mut report = TickReport {
            expired: self
                .directory
                .expire(now, u64::from(self.config.entry_max_age_ms)),
            ..TickReport::default()
        };

        match self
            .announcer
            .on_timer_tick(now, &self.config.name, &mut self.transport)
        {
            Ok(sent) => report.announced = sent,
            Err(e) => log::warn!("{}", e),
        }

        let interval = u64::from(self.config.measure_interval_ms);
        match self.next_measure {
            None => self.next_measure = Some(now.saturating_add(interval)),
            Some(due) if now >= due => {
                self.next_measure = Some(now.saturating_add(interval));
                let (measured, forwarded) = self.measure_and_forward();
                report.measured = Some(measured);
                report.forwarded = Some(forwarded);
            }
            Some(_) => {}
        }

        report
    }

    /// Take a reading and push it down the chain together with any pending
    /// upstream packet.
    ///
    /// A failed measurement still produces an entry: the invalid reading is
    /// sent alongside the occupancy of the last valid one.
    pub fn measure_and_forward(&mut self) -> (Result<SensorReading, SensorError>, Forwarded) {
        let measured = self.sensor.measure();
        let reading = match measured {
            Ok(r) => r,
            Err(_) => self
                .sensor
                .last_reading()
                .unwrap_or(SensorReading::timed_out()),
        };

        if self.config.name.is_empty() {
            log::warn!("No node name assigned, reading not forwarded");
            return (measured, Forwarded::Unnamed);
        }

        let occupied = self.sensor.is_occupied();
        let packet = self
            .forwarder
            .build_outgoing(&reading, occupied, self.upstream.take());

        if self.forwarder.is_sink() {
            log::info!(
                "Chain sink collected {} reading(s) over {} hop(s)",
                packet.readings.len(),
                packet.hops
            );
            return (measured, Forwarded::Sink(packet));
        }

        let forwarded = match self
            .forwarder
            .send(&packet, &self.directory, &mut self.transport)
        {
            Ok(to) => Forwarded::Sent(to),
            Err(e) => Forwarded::Dropped(e),
        };
        (measured, forwarded)
    }

    /// Handle a frame delivered by the transport.
    ///
    /// Telemetry packets are also kept as the pending upstream packet so the
    /// next outgoing packet carries them on.
    pub fn on_receive(&mut self, from: NodeAddress, payload: &[u8], now: u64) -> Routed {
        let routed = self
            .router
            .route(from, payload, &mut self.directory, now);

        if routed == Routed::Delivered {
            if let Some(packet) = comm::decode_telemetry(payload) {
                if let Some(old) = self.upstream.replace(packet) {
                    log::warn!(
                        "Unsent upstream packet from '{}' replaced before forwarding",
                        old.source
                    );
                }
            }
        }
        routed
    }

    /// The transport reports `address` gone.
    pub fn on_disconnect(&mut self, address: NodeAddress) {
        self.directory.on_disconnect(address);
    }

    /// Assign the announced name. Announcing (re)starts at the next tick.
    pub fn set_name(&mut self, name: &str) -> Result<(), ConfigError> {
        let name = config::node_name(name)?;
        log::info!("Node name set to '{}'", name);
        self.forwarder.set_self_name(name.clone());
        self.config.name = name;
        self.announcer.reset();
        Ok(())
    }

    pub fn set_occupied_threshold(&mut self, cm: u16) -> Result<(), ConfigError> {
        self.sensor.set_occupied_threshold(cm)?;
        self.config.occupied_threshold_cm = cm;
        Ok(())
    }

    /// Apply a console command and encode the reply line into `out`.
    pub fn handle_command(&mut self, cmd: &HostCommand, now: u64, out: &mut MsgBuffer) -> Option<usize> {
        match cmd {
            HostCommand::GetStatus => {
                let status = self.status(now);
                comm::encode_device_message(&DeviceMessage::Status(&status), out)
            }
            HostCommand::ListNodes => {
                let nodes = self.directory.listing(now);
                comm::encode_device_message(&DeviceMessage::Nodes { nodes: &nodes }, out)
            }
            HostCommand::SetThreshold { cm } => {
                let result = self.set_occupied_threshold(*cm);
                ack("set_threshold", result, out)
            }
            HostCommand::SetName { name } => {
                let result = self.set_name(name);
                ack("set_name", result, out)
            }
        }
    }

    pub fn status(&self, now: u64) -> NodeStatus {
        let sensor = self.sensor.status();
        NodeStatus {
            name: self.config.name.clone(),
            next: self.config.successor.clone(),
            uptime: (now / 1000) as u32,
            peers: self.directory.len() as u8,
            links: self.transport.connected_addresses().len() as u8,
            next_known: self.successor_address().is_some(),
            occupied: sensor.occupied,
            distance_cm: sensor.last_valid_cm,
            threshold_cm: sensor.threshold_cm,
            measurements: sensor.measurements,
            errors: sensor.errors,
            sent: self.forwarder.sent(),
            dropped: self.forwarder.dropped(),
            board: board::BOARD_NAME,
            version: VERSION,
        }
    }

    /// Current address of the configured successor.
    pub fn successor_address(&self) -> Option<NodeAddress> {
        self.config
            .successor
            .as_deref()
            .and_then(|next| self.directory.resolve(next))
    }

    pub fn resolve(&self, name: &str) -> Option<NodeAddress> {
        self.directory.resolve(name)
    }

    pub fn name(&self) -> &NodeName {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    pub fn sensor(&self) -> &RangeSensor<P> {
        &self.sensor
    }

    pub fn forwarder(&self) -> &TelemetryForwarder {
        &self.forwarder
    }

    pub fn router(&self) -> &MessageRouter<H> {
        &self.router
    }

    pub fn handler_mut(&mut self) -> &mut H {
        self.router.handler_mut()
    }

    pub fn upstream(&self) -> Option<&TelemetryPacket> {
        self.upstream.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

fn ack(cmd: &'static str, result: Result<(), ConfigError>, out: &mut MsgBuffer) -> Option<usize> {
    let error = match result {
        Ok(()) => None,
        Err(ConfigError::ThresholdOutOfRange(_)) => Some("threshold_out_of_range"),
        Err(ConfigError::EmptyName) => Some("empty_name"),
        Err(ConfigError::NameTooLong) => Some("name_too_long"),
        Err(_) => Some("invalid_config"),
    };
    let msg = DeviceMessage::Ack {
        cmd,
        ok: error.is_none(),
        error,
    };
    comm::encode_device_message(&msg, out)
}
