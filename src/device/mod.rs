//! Device service object for a BNC 565 class delay generator.
//!
//! [`Device`] owns the transport, the command bridge, the tick scheduler and
//! the cached snapshot. It is constructed once by the composition root and
//! shared as `Arc<Device>`; there is no global instance.
//!
//! # Operations
//!
//! - [`Device::connect`] / [`Device::disconnect`]: open or close the link.
//!   Connecting resets the timeout counters and runs an initial fetch.
//! - [`Device::fetch`]: query identity and every channel attribute. One bad
//!   reply costs one field, never the whole fetch. Without a link it returns
//!   deterministic placeholder values.
//! - [`Device::commit`]: push a protocol as best-effort directives, each
//!   retried until acknowledged. Without a link it does nothing.
//! - [`Device::send`]: raw pass-through.
//! - [`Device::shutdown`]: stop the ticks, drain the read task, release the
//!   port, in that order.
//!
//! # Example
//!
//! ```no_run
//! use dgctl::config::Settings;
//! use dgctl::device::Device;
//! use dgctl::transport::MockTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = Arc::new(Device::new(Settings::default(), Arc::new(MockTransport::simulator())));
//!     device.connect("sim", 115200).await?;
//!
//!     let mut snapshot = device.fetch().await;
//!     snapshot.protocol.channels[0].width = 2.0e-6;
//!     let report = device.commit(&snapshot.protocol).await;
//!     assert!(report.is_success());
//!
//!     device.shutdown().await;
//!     Ok(())
//! }
//! ```

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::Settings;
use crate::error::DgResult;
use crate::tick::{DeviceStatus, StatusSource, Subscription, Tick, TickScheduler};
use crate::transport::Transport;

pub mod commands;
pub mod json;
pub mod protocol;

pub use protocol::{DeviceIdentity, DeviceProtocol, DeviceSnapshot, Polarity, PulseChannel, Switch};

use commands::{Attribute, ACK};

/// Link diagnostics as reported to the request layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Whether the transport is open.
    pub is_open: bool,
    /// Port the device was last connected on.
    pub port_name: String,
    /// Baud rate for that port.
    pub baud_rate: u32,
    /// Write timeouts since the last connect.
    pub write_timeouts: u64,
    /// Reply timeouts since the last connect.
    pub reply_timeouts: u64,
}

/// Outcome of a [`Device::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    /// No link; nothing was sent.
    pub skipped: bool,
    /// Directives sent, including the failed ones.
    pub attempted: usize,
    /// Directives never acknowledged with `ok`.
    pub failed: Vec<String>,
}

impl CommitReport {
    /// True when every directive was acknowledged.
    pub fn is_success(&self) -> bool {
        !self.skipped && self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct LinkRecord {
    port_name: String,
    baud_rate: u32,
}

/// A BNC 565 behind a command bridge, with a cached model and a liveness tick.
pub struct Device {
    settings: Settings,
    transport: Arc<dyn Transport>,
    bridge: Bridge,
    /// Cached open flag; the tick status source reads this, never the bridge.
    is_open: Arc<AtomicBool>,
    link: RwLock<LinkRecord>,
    cache: Arc<RwLock<DeviceSnapshot>>,
    /// Serializes fetch/commit/reset cycles against each other.
    cycle: Mutex<()>,
    ticks: TickScheduler,
}

impl Device {
    /// Wire up a device on `transport` and start the tick timer.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since the tick timer is
    /// spawned here.
    pub fn new(settings: Settings, transport: Arc<dyn Transport>) -> Self {
        let bridge = Bridge::new(transport.clone(), &settings.serial);
        let is_open = Arc::new(AtomicBool::new(false));
        let cache = Arc::new(RwLock::new(DeviceSnapshot::default()));

        let status_source: StatusSource = {
            let is_open = is_open.clone();
            let transport = transport.clone();
            let cache = cache.clone();
            Arc::new(move || DeviceStatus {
                is_open: is_open.load(Ordering::SeqCst) && transport.is_open(),
                master_on: cache.read().protocol.state.is_on(),
            })
        };
        let ticks = TickScheduler::start(settings.tick.period(), status_source);

        Self {
            settings,
            transport,
            bridge,
            is_open,
            link: RwLock::new(LinkRecord::default()),
            cache,
            cycle: Mutex::new(()),
            ticks,
        }
    }

    /// Settings the device was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Whether the serial link is open.
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst) && self.transport.is_open()
    }

    /// Link state and counters for status pages.
    pub fn connection_state(&self) -> ConnectionState {
        let link = self.link.read();
        let counters = self.bridge.stats().snapshot();
        ConnectionState {
            is_open: self.is_open(),
            port_name: link.port_name.clone(),
            baud_rate: link.baud_rate,
            write_timeouts: counters.write_timeouts,
            reply_timeouts: counters.reply_timeouts,
        }
    }

    /// Last fetched identity; empty before the first successful exchange.
    pub fn identity(&self) -> DeviceIdentity {
        self.cache.read().identity.clone()
    }

    /// Last fetched snapshot without touching the device.
    pub fn cached(&self) -> DeviceSnapshot {
        self.cache.read().clone()
    }

    /// Open the link, reset counters, and run the initial fetch.
    pub async fn connect(&self, port: &str, baud_rate: u32) -> DgResult<DeviceIdentity> {
        let _cycle = self.cycle.lock().await;

        self.bridge.reset_link();
        if let Err(e) = self.transport.open(port, baud_rate).await {
            warn!(port, baud_rate, "Open failed: {}", e);
            self.is_open.store(false, Ordering::SeqCst);
            return Err(e);
        }

        {
            let mut link = self.link.write();
            link.port_name = port.to_string();
            link.baud_rate = baud_rate;
        }
        self.is_open.store(true, Ordering::SeqCst);
        info!(
            port,
            baud_rate,
            transport = self.transport.name(),
            "Delay generator connected"
        );

        let snapshot = self.fetch_cycle().await;
        if snapshot.identity.is_known() {
            info!(idn = %snapshot.identity.idn, "Device identified");
        } else {
            warn!("Device did not identify itself");
        }
        Ok(snapshot.identity)
    }

    /// Close the link. Safe to call when already closed.
    pub async fn disconnect(&self) {
        let was_open = self.is_open.swap(false, Ordering::SeqCst);
        self.transport.close().await;
        if was_open {
            info!(port = %self.link.read().port_name, "Delay generator disconnected");
        }
    }

    /// Checkbox-style toggle used by the request layer.
    pub async fn switch_connect(&self, on: bool) -> String {
        if on {
            let port = self.settings.serial.port.clone();
            let baud = self.settings.serial.baud_rate;
            match self.connect(&port, baud).await {
                Ok(identity) => format!("connected to {} ({})", port, identity.idn),
                Err(e) => format!("Error: {}", e),
            }
        } else {
            self.disconnect().await;
            "disconnected".to_string()
        }
    }

    /// Query the device and replace the cached snapshot.
    ///
    /// Without a link, returns [`DeviceSnapshot::placeholder`] and leaves the
    /// cache alone.
    pub async fn fetch(&self) -> DeviceSnapshot {
        if !self.is_open() {
            return DeviceSnapshot::placeholder();
        }
        let _cycle = self.cycle.lock().await;
        self.fetch_cycle().await
    }

    async fn fetch_cycle(&self) -> DeviceSnapshot {
        let mut snapshot = self.cache.read().clone();

        if let Some(idn) = self.query_text(commands::IDN).await {
            snapshot.identity.idn = idn;
        }
        if let Some(full) = self.query_text(commands::INST_FULL).await {
            snapshot.identity.instrument_full = full;
        }

        let protocol = &mut snapshot.protocol;
        self.query_into(
            commands::MASTER_STATE_QUERY,
            commands::parse_switch,
            &mut protocol.state,
        )
        .await;
        self.query_into(
            commands::PERIOD_QUERY,
            commands::parse_seconds,
            &mut protocol.interval,
        )
        .await;

        for (i, ch) in protocol.channels.iter_mut().enumerate() {
            let n = DeviceProtocol::wire_channel(i);
            for attr in Attribute::FETCH_ORDER {
                let command = commands::query(n, attr);
                match attr {
                    Attribute::State => {
                        self.query_into(&command, commands::parse_switch, &mut ch.state)
                            .await
                    }
                    Attribute::Width => {
                        self.query_into(&command, commands::parse_seconds, &mut ch.width)
                            .await
                    }
                    Attribute::Delay => {
                        self.query_into(&command, commands::parse_seconds, &mut ch.delay)
                            .await
                    }
                    Attribute::Polarity => {
                        self.query_into(&command, commands::parse_polarity, &mut ch.polarity)
                            .await
                    }
                }
            }
        }

        *self.cache.write() = snapshot.clone();
        debug!("Snapshot refreshed");
        snapshot
    }

    async fn query_text(&self, command: &str) -> Option<String> {
        match self.bridge.send(command).await {
            Ok(reply) => match commands::check_reply(command, &reply) {
                Ok(text) => Some(text.to_string()),
                Err(e) => {
                    warn!(command, "{}", e);
                    None
                }
            },
            Err(e) => {
                warn!(command, "Query failed: {}", e);
                None
            }
        }
    }

    /// Parse one reply into `slot`; on any failure keep the old value.
    async fn query_into<T>(
        &self,
        command: &str,
        parse: fn(&str, &str) -> DgResult<T>,
        slot: &mut T,
    ) {
        match self
            .bridge
            .send(command)
            .await
            .and_then(|reply| parse(command, &reply))
        {
            Ok(value) => *slot = value,
            Err(e) => warn!(command, "Keeping previous value: {}", e),
        }
    }

    /// Push `protocol` to the device.
    ///
    /// Every directive is attempted even if earlier ones failed. Without a
    /// link nothing is sent and the report is marked `skipped`.
    pub async fn commit(&self, protocol: &DeviceProtocol) -> CommitReport {
        if !self.is_open() {
            debug!("Commit skipped, not connected");
            return CommitReport {
                skipped: true,
                ..CommitReport::default()
            };
        }

        let _cycle = self.cycle.lock().await;
        let attempts = self.settings.commit.attempts;
        let mut report = CommitReport::default();

        for directive in commands::commit_directives(protocol) {
            report.attempted += 1;
            if !self.bridge.send_expect(&directive, ACK, attempts).await {
                report.failed.push(directive);
            }
        }

        if report.failed.is_empty() {
            info!(directives = report.attempted, "Commit acknowledged");
        } else {
            warn!(
                directives = report.attempted,
                failed = report.failed.len(),
                "Commit partially applied"
            );
        }
        report
    }

    /// `*RST`, the factory pulse layout, then the trigger chain.
    ///
    /// Returns true only if the reset and every step of the trigger chain
    /// (channel 5 sync and width, master trigger on) are acknowledged. The
    /// layout directives and the channel 6 ion-peak setup are best-effort;
    /// the ion peak is only configured once the trigger is running.
    pub async fn reset(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        let _cycle = self.cycle.lock().await;
        let attempts = self.settings.commit.attempts;

        if !self.bridge.send_expect(commands::RESET, ACK, attempts).await {
            warn!("Device did not acknowledge reset");
            return false;
        }
        for directive in commands::reset_directives() {
            self.bridge.send_expect(&directive, ACK, attempts).await;
        }

        for directive in commands::reset_trigger_chain() {
            if !self.bridge.send_expect(&directive, ACK, attempts).await {
                warn!(directive = %directive, "Trigger chain broken, reset incomplete");
                return false;
            }
        }

        for directive in commands::ion_peak_directives() {
            self.bridge.send_expect(&directive, ACK, attempts).await;
        }
        info!("Device reset to factory layout, trigger running");
        true
    }

    /// Raw pass-through; returns the first reply line.
    pub async fn send(&self, command: &str) -> DgResult<String> {
        self.bridge.send(command).await
    }

    /// Registers a tick callback. Dropping the handle unregisters it.
    pub fn subscribe_ticks(&self, callback: impl Fn(Tick) + Send + Sync + 'static) -> Subscription {
        self.ticks.subscribe(callback)
    }

    /// The tick scheduler owned by this device.
    pub fn ticks(&self) -> &TickScheduler {
        &self.ticks
    }

    /// Ordered teardown: timer, delivery task, port.
    pub async fn shutdown(&self) {
        let grace = self.settings.shutdown.grace();
        self.ticks.stop(grace).await;
        self.is_open.store(false, Ordering::SeqCst);
        self.transport.close().await;
        info!("Device shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn device_on(mock: &Arc<MockTransport>) -> Device {
        Device::new(Settings::default(), mock.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_identifies_and_caches() {
        let mock = Arc::new(MockTransport::simulator());
        let device = device_on(&mock);

        let identity = device.connect("/dev/ttyUSB0", 115200).await.unwrap();
        assert_eq!(identity.idn, "BNC,565-8,SIM0001,2.4.0");
        assert_eq!(device.identity(), identity);

        let state = device.connection_state();
        assert!(state.is_open);
        assert_eq!(state.port_name, "/dev/ttyUSB0");
        assert_eq!(state.baud_rate, 115200);
        assert_eq!(state.reply_timeouts, 0);

        // simulator default: channel n delay n*10us
        let cached = device.cached();
        assert!((cached.protocol.channels[2].delay - 3.0e-5).abs() < 1e-12);
        device.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_query_order() {
        let mock = Arc::new(MockTransport::simulator());
        let device = device_on(&mock);
        device.connect("sim", 9600).await.unwrap();
        mock.clear_commands();

        device.fetch().await;
        let commands = mock.commands();
        assert_eq!(
            &commands[..8],
            &[
                "*IDN?",
                ":INST:FULL?",
                ":PULSE0:STATE?",
                ":PULSE0:PER?",
                ":PULSE1:STATE?",
                ":PULSE1:WIDTH?",
                ":PULSE1:DELAY?",
                ":PULSE1:POL?",
            ]
        );
        assert_eq!(commands.len(), 4 + 8 * 4);
        device.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_fetch_returns_placeholder_without_caching() {
        let mock = Arc::new(MockTransport::simulator());
        let device = device_on(&mock);

        let snapshot = device.fetch().await;
        assert_eq!(snapshot.protocol, DeviceProtocol::placeholder());
        assert_eq!(device.cached(), DeviceSnapshot::default());
        assert!(mock.commands().is_empty());
        device.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_then_fetch_round_trip() {
        let mock = Arc::new(MockTransport::simulator());
        let device = device_on(&mock);
        device.connect("sim", 9600).await.unwrap();

        let mut protocol = DeviceProtocol::placeholder();
        protocol.channels[5].state = Switch::On;
        protocol.interval = 5.0e-4;
        let report = device.commit(&protocol).await;
        assert!(report.is_success(), "{:?}", report);
        assert_eq!(report.attempted, 35);

        let fetched = device.fetch().await.protocol;
        assert_eq!(fetched.state, Switch::On);
        assert!((fetched.interval - 5.0e-4).abs() < 1e-12);
        for (a, b) in fetched.channels.iter().zip(&protocol.channels) {
            assert!((a.delay - b.delay).abs() < 1e-12);
            assert!((a.width - b.width).abs() < 1e-12);
            assert_eq!(a.polarity, b.polarity);
            assert_eq!(a.state, b.state);
        }
        device.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_applies_factory_layout() {
        let mock = Arc::new(MockTransport::simulator());
        let device = device_on(&mock);
        device.connect("sim", 9600).await.unwrap();

        assert!(device.reset().await);
        let p = device.fetch().await.protocol;
        assert!(p.channels.iter().all(|c| c.state.is_on()));
        assert!((p.channels[7].delay - 8.0e-5).abs() < 1e-12);
        assert_eq!(p.state, Switch::On);

        // channel 6 carries the ion peak
        let ion = &p.channels[5];
        assert_eq!(ion.polarity, Polarity::Inverted);
        assert!((ion.width - 4.0e-9).abs() < 1e-15);
        assert!((ion.delay - 1.8e-6).abs() < 1e-12);
        assert!((p.channels[4].width - 1.0e-6).abs() < 1e-12);
        assert!(mock.commands().contains(&":PULSE5:SYNC CHA".to_string()));
        device.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_fails_when_trigger_chain_is_rejected() {
        let mut sim = crate::transport::Bnc565Simulator::new();
        let mock = Arc::new(MockTransport::new(move |cmd: &str| {
            if cmd == ":PULSE0:STATE ON" {
                vec!["?".to_string()]
            } else {
                crate::transport::Responder::respond(&mut sim, cmd)
            }
        }));
        let settings = Settings {
            commit: crate::config::CommitConfig { attempts: 2 },
            ..Settings::default()
        };
        let device = Device::new(settings, mock.clone());
        device.connect("sim", 9600).await.unwrap();

        assert!(!device.reset().await);
        // ion peak setup never starts
        assert!(!mock.commands().iter().any(|c| c.starts_with(":PULSE6:SYNC")));
        device.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let mock = Arc::new(MockTransport::simulator());
        let device = device_on(&mock);
        device.connect("sim", 9600).await.unwrap();

        device.disconnect().await;
        device.disconnect().await;
        assert!(!device.is_open());
        assert!(!device.reset().await);
        device.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_connect_uses_configured_port() {
        let mock = Arc::new(MockTransport::simulator());
        let device = device_on(&mock);

        let msg = device.switch_connect(true).await;
        assert!(msg.starts_with("connected to /dev/ttyUSB0"), "{}", msg);
        assert_eq!(device.switch_connect(false).await, "disconnected");
        assert_eq!(mock.open_count(), 1);
        device.shutdown().await;
    }

    #[test]
    #[should_panic]
    fn test_new_outside_runtime_panics() {
        let mock = Arc::new(MockTransport::simulator());
        let _ = device_on(&mock);
    }
}
