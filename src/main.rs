//! Raedam node firmware
//!
//! One parking-space sensor in a named-node mesh. Reads an HC-SR04 under the
//! space, announces its name over ESP-NOW and forwards its reading, plus the
//! readings of the nodes before it, to the next node in the chain. The chain
//! sink prints the collected packet as NDJSON on serial for the uplink.

#![no_std]
#![no_main]

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

#[cfg(not(any(feature = "board-devkit", feature = "board-xiao")))]
compile_error!("select a board feature: `devkit` or `xiao`");

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Ticker};
use esp_hal::delay::Delay;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::uart::{self, Uart, UartRx};
use esp_hal::Async;
use esp_radio::esp_now::{
    EspNowManager, EspNowReceiver, EspNowSender, EspNowWifiInterface, PeerInfo,
    BROADCAST_ADDRESS,
};
use esp_radio::wifi::WifiController;
use heapless::Vec;
use static_cell::StaticCell;

use raedam_node::board;
use raedam_node::comm::{self, LineReader};
use raedam_node::config::NodeConfig;
use raedam_node::node::{Forwarded, Node};
use raedam_node::protocol::{
    DeviceMessage, HostCommand, MsgBuffer, NodeAddress, MAX_FRAME_LEN, VERSION,
};
use raedam_node::router::ReceiveHandler;
use raedam_node::sensor::{HcSr04, MicrosClock};
use raedam_node::transport::{MeshTransport, PeerTable, TransportError, MAX_PEERS};

/// Node timer resolution
const TICK: Duration = Duration::from_secs(1);

// ── Channel type aliases ──────────────────────────────────────────────

/// Frame received over ESP-NOW
struct Inbound {
    mac: [u8; 6],
    data: MsgBuffer,
}

/// Frame queued for ESP-NOW; `None` destination means broadcast
struct Outbound {
    dest: Option<[u8; 6]>,
    data: MsgBuffer,
}

type InboundChannel = Channel<CriticalSectionRawMutex, Inbound, 8>;
type OutboundChannel = Channel<CriticalSectionRawMutex, Outbound, 8>;
type OutputChannel = Channel<CriticalSectionRawMutex, MsgBuffer, 8>;
type CommandChannel = Channel<CriticalSectionRawMutex, HostCommand, 4>;

// ── Static channels ───────────────────────────────────────────────────

static INBOUND_CHANNEL: InboundChannel = Channel::new();
static OUTBOUND_CHANNEL: OutboundChannel = Channel::new();

/// Serialized NDJSON lines for the serial console
static OUTPUT_CHANNEL: OutputChannel = Channel::new();

static CMD_CHANNEL: CommandChannel = Channel::new();

static WIFI_CONTROLLER: StaticCell<WifiController<'static>> = StaticCell::new();
static ESP_NOW_MANAGER: StaticCell<EspNowManager<'static>> = StaticCell::new();

// ── Platform glue ─────────────────────────────────────────────────────

/// [`MeshTransport`] over ESP-NOW. Frames are queued for the TX task; the
/// peer table maps mesh addresses back to MACs.
struct EspNowMesh {
    peers: PeerTable,
}

impl EspNowMesh {
    const fn new() -> Self {
        Self {
            peers: PeerTable::new(),
        }
    }

    fn queue(&self, dest: Option<[u8; 6]>, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(TransportError::PayloadTooLarge);
        }
        let data = MsgBuffer::from_slice(payload).map_err(|_| TransportError::PayloadTooLarge)?;
        OUTBOUND_CHANNEL
            .try_send(Outbound { dest, data })
            .map_err(|_| TransportError::QueueFull)
    }
}

impl MeshTransport for EspNowMesh {
    fn broadcast(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.queue(None, payload)
    }

    fn send_to(&mut self, to: NodeAddress, payload: &[u8]) -> Result<(), TransportError> {
        let mac = self.peers.mac_of(to).ok_or(TransportError::NotConnected)?;
        self.queue(Some(mac), payload)
    }

    fn connected_addresses(&self) -> Vec<NodeAddress, MAX_PEERS> {
        self.peers.addresses()
    }
}

struct EmbassyClock;

impl MicrosClock for EmbassyClock {
    fn now_us(&mut self) -> u64 {
        Instant::now().as_micros()
    }
}

/// Receive handler for application payloads. Telemetry is consumed by the
/// node itself; anything else is only logged.
struct LogHandler;

impl ReceiveHandler for LogHandler {
    fn on_message(&mut self, sender: &str, payload: &[u8]) {
        log::debug!("{} bytes from '{}'", payload.len(), sender);
    }
}

type Rangefinder = HcSr04<Output<'static>, Input<'static>, Delay, EmbassyClock>;
type FirmwareNode = Node<EspNowMesh, Rangefinder, LogHandler>;

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

fn emit(msg: &DeviceMessage) {
    let mut buf = MsgBuffer::new();
    if comm::encode_device_message(msg, &mut buf).is_none() {
        log::warn!("Console message exceeds {} bytes, dropped", buf.capacity());
        return;
    }
    if OUTPUT_CHANNEL.try_send(buf).is_err() {
        log::warn!("Console output queue full, message dropped");
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // WiFi driver needs a heap
    esp_alloc::heap_allocator!(size: 64 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!("Raedam node v{} starting on {}", VERSION, board::BOARD_NAME);

    let config = NodeConfig::provisioned().expect("invalid provisioning");

    // ── Rangefinder ──────────────────────────────────────────────────

    #[cfg(feature = "board-devkit")]
    let (trig_pin, echo_pin, led_pin) = (peripherals.GPIO12, peripherals.GPIO27, peripherals.GPIO2);
    #[cfg(feature = "board-xiao")]
    let (trig_pin, echo_pin, led_pin) = (peripherals.GPIO2, peripherals.GPIO3, peripherals.GPIO21);

    let trig = Output::new(trig_pin, Level::Low, OutputConfig::default());
    let echo = Input::new(echo_pin, InputConfig::default().with_pull(Pull::Down));
    let led = Output::new(led_pin, Level::Low, OutputConfig::default());
    let rangefinder =
        HcSr04::new(trig, echo, Delay::new(), EmbassyClock).expect("rangefinder init failed");

    log::info!(
        "Rangefinder on trig GPIO{} / echo GPIO{}",
        board::TRIG_PIN,
        board::ECHO_PIN
    );

    // ── Serial console ───────────────────────────────────────────────

    #[cfg(feature = "board-devkit")]
    let (rx_pin, tx_pin) = (peripherals.GPIO3, peripherals.GPIO1);
    #[cfg(feature = "board-xiao")]
    let (rx_pin, tx_pin) = (peripherals.GPIO44, peripherals.GPIO43);

    let uart = Uart::new(
        peripherals.UART0,
        uart::Config::default().with_baudrate(comm::SERIAL_BAUD),
    )
    .expect("UART init failed")
    .with_rx(rx_pin)
    .with_tx(tx_pin)
    .into_async();
    let (uart_rx, _uart_tx) = uart.split();

    log::info!(
        "Console on UART0 rx GPIO{} / tx GPIO{} at {} baud",
        board::UART_RX_PIN,
        board::UART_TX_PIN,
        comm::SERIAL_BAUD
    );

    // ── ESP-NOW ──────────────────────────────────────────────────────

    let (mut controller, interfaces) =
        esp_radio::wifi::new(peripherals.WIFI, Default::default()).expect("WiFi init failed");
    controller
        .set_config(&esp_radio::wifi::ModeConfig::Client(Default::default()))
        .expect("WiFi station mode failed");
    controller.start().expect("WiFi start failed");
    let _controller = WIFI_CONTROLLER.init(controller);

    let esp_now = interfaces.esp_now;
    log::info!("ESP-NOW version {}", esp_now.version().unwrap_or(0));
    let (manager, sender, receiver) = esp_now.split();
    let manager = ESP_NOW_MANAGER.init(manager);

    // ── Node ─────────────────────────────────────────────────────────

    let node = Node::new(config, EspNowMesh::new(), rangefinder, LogHandler)
        .expect("invalid node configuration");

    spawner.spawn(output_serial_task()).unwrap();
    spawner.spawn(uart_rx_task(uart_rx)).unwrap();
    spawner.spawn(esp_now_rx_task(receiver)).unwrap();
    spawner.spawn(esp_now_tx_task(manager, sender)).unwrap();
    spawner.spawn(node_task(node, led)).unwrap();
}

/// ESP-NOW receive task: queue every frame for the node task.
#[embassy_executor::task]
async fn esp_now_rx_task(mut receiver: EspNowReceiver<'static>) {
    loop {
        let received = receiver.receive_async().await;
        let Ok(data) = MsgBuffer::from_slice(received.data()) else {
            continue;
        };
        let frame = Inbound {
            mac: received.info.src_address,
            data,
        };
        if INBOUND_CHANNEL.try_send(frame).is_err() {
            log::warn!("Inbound queue full, frame dropped");
        }
    }
}

/// ESP-NOW transmit task: registers unknown peers on first use.
#[embassy_executor::task]
async fn esp_now_tx_task(manager: &'static EspNowManager<'static>, mut sender: EspNowSender<'static>) {
    let outbound_rx = OUTBOUND_CHANNEL.receiver();

    loop {
        let frame = outbound_rx.receive().await;
        let dest = frame.dest.unwrap_or(BROADCAST_ADDRESS);

        if !manager.peer_exists(&dest) {
            let peer = PeerInfo {
                interface: EspNowWifiInterface::Sta,
                peer_address: dest,
                lmk: None,
                channel: None,
                encrypt: false,
            };
            if let Err(e) = manager.add_peer(peer) {
                log::warn!("Could not add ESP-NOW peer: {:?}", e);
                continue;
            }
        }

        if let Err(e) = sender.send_async(&dest, &frame.data).await {
            log::warn!("ESP-NOW send failed: {:?}", e);
        }
    }
}

/// Serial console input: NDJSON commands into CMD_CHANNEL.
#[embassy_executor::task]
async fn uart_rx_task(mut rx: UartRx<'static, Async>) {
    let mut line_reader = LineReader::new();
    let mut buf = [0u8; 64];

    loop {
        let n = match rx.read_async(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("UART read error: {:?}", e);
                continue;
            }
        };
        for &byte in &buf[..n] {
            if let Some(line) = line_reader.feed(byte) {
                match comm::parse_command(line) {
                    Some(cmd) => {
                        let _ = CMD_CHANNEL.try_send(cmd);
                    }
                    None => log::warn!("Unrecognized command"),
                }
            }
        }
    }
}

/// Serial output task: prints queued NDJSON lines.
#[embassy_executor::task]
async fn output_serial_task() {
    let output_rx = OUTPUT_CHANNEL.receiver();

    loop {
        let msg = output_rx.receive().await;
        if let Ok(s) = core::str::from_utf8(&msg) {
            esp_println::println!("{}", s.trim_end());
        }
    }
}

/// Node task: sole owner of the node. Timer ticks, received frames and
/// console commands are handled one at a time.
#[embassy_executor::task]
async fn node_task(mut node: FirmwareNode, mut led: Output<'static>) {
    let inbound_rx = INBOUND_CHANNEL.receiver();
    let cmd_rx = CMD_CHANNEL.receiver();
    let peer_timeout = u64::from(node.config().entry_max_age_ms);
    let mut reply = MsgBuffer::new();

    log::info!("Node task started as '{}'", node.name());

    // Fixed-rate so inbound traffic cannot push the next tick back.
    let mut ticker = Ticker::every(TICK);
    loop {
        match select3(inbound_rx.receive(), cmd_rx.receive(), ticker.next()).await {
            Either3::First(frame) => {
                let now = now_ms();
                let from = node.transport_mut().peers.note(&frame.mac, now);
                node.on_receive(from, &frame.data, now);
            }
            Either3::Second(cmd) => {
                if node.handle_command(&cmd, now_ms(), &mut reply).is_some() {
                    let _ = OUTPUT_CHANNEL.try_send(reply.clone());
                }
            }
            Either3::Third(()) => {
                let now = now_ms();
                for gone in node.transport_mut().peers.reap(now, peer_timeout) {
                    log::info!("Peer {} silent, disconnecting", gone);
                    node.on_disconnect(gone);
                }

                // Blocks for up to one echo timeout while ranging
                let report = node.on_timer_tick(now);
                if report.measured.is_some() {
                    led.set_level(Level::from(node.sensor().is_occupied()));
                }
                if let Some(Forwarded::Sink(packet)) = report.forwarded {
                    emit(&DeviceMessage::Telemetry {
                        source: &packet.source,
                        hops: packet.hops,
                        readings: &packet.readings,
                    });
                }
            }
        }
    }
}
