//! In-process transport for tests and the `--simulate` mode.
//!
//! Every write is recorded and handed to a [`Responder`], which decides what
//! the "device" sends back. Replies are delivered to the registered reader
//! from a spawned task, optionally after a latency and optionally split into
//! small chunks, the way a real serial driver would hand them over.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ReaderFn, Transport};
use crate::device::commands::{format_seconds, CHANNEL_COUNT};
use crate::error::{DgError, DgResult};

/// Produces the reply lines for one command (without terminators).
pub trait Responder: Send {
    /// Returns the lines to deliver after `command` is written.
    fn respond(&mut self, command: &str) -> Vec<String>;
}

impl<F> Responder for F
where
    F: FnMut(&str) -> Vec<String> + Send,
{
    fn respond(&mut self, command: &str) -> Vec<String> {
        self(command)
    }
}

/// Transport that answers writes through a [`Responder`] instead of a port.
pub struct MockTransport {
    open: AtomicBool,
    reader: Mutex<Option<ReaderFn>>,
    responder: Mutex<Box<dyn Responder>>,
    written: Mutex<Vec<String>>,
    opens: AtomicUsize,
    latency: Mutex<Duration>,
    chunk_size: Mutex<Option<usize>>,
    stall_writes: AtomicBool,
}

impl MockTransport {
    /// Creates a closed mock driven by `responder`.
    pub fn new(responder: impl Responder + 'static) -> Self {
        Self {
            open: AtomicBool::new(false),
            reader: Mutex::new(None),
            responder: Mutex::new(Box::new(responder)),
            written: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            chunk_size: Mutex::new(None),
            stall_writes: AtomicBool::new(false),
        }
    }

    /// A device that never answers.
    pub fn silent() -> Self {
        Self::new(|_: &str| Vec::<String>::new())
    }

    /// A device that answers every command with the same line.
    pub fn always(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_: &str| vec![reply.clone()])
    }

    /// A stateful BNC 565 stand-in.
    pub fn simulator() -> Self {
        Self::new(Bnc565Simulator::new())
    }

    /// Delays every reply by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Deliver replies in chunks of at most `size` bytes.
    pub fn with_chunk_size(self, size: usize) -> Self {
        *self.chunk_size.lock() = Some(size.max(1));
        self
    }

    /// Make every write hang until the caller's timeout fires.
    pub fn set_stall_writes(&self, stall: bool) {
        self.stall_writes.store(stall, Ordering::SeqCst);
    }

    /// Commands written so far, terminators stripped.
    pub fn commands(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    /// Forgets the recorded commands.
    pub fn clear_commands(&self) {
        self.written.lock().clear();
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Push raw bytes to the reader as if the device sent them unprompted.
    pub fn inject(&self, bytes: &[u8]) {
        let reader = self.reader.lock().clone();
        if let Some(reader) = reader {
            reader(bytes);
        }
    }

    fn deliver(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let Some(reader) = self.reader.lock().clone() else {
            return;
        };
        let latency = *self.latency.lock();
        let chunk_size = *self.chunk_size.lock();

        let mut payload = Vec::new();
        for line in lines {
            payload.extend_from_slice(line.as_bytes());
            payload.extend_from_slice(b"\r\n");
        }

        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match chunk_size {
                Some(size) => {
                    for chunk in payload.chunks(size) {
                        reader(chunk);
                        tokio::task::yield_now().await;
                    }
                }
                None => reader(&payload),
            }
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, port: &str, baud_rate: u32) -> DgResult<()> {
        debug!(port, baud_rate, "Mock transport opened");
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write(&self, bytes: &[u8], timeout: Duration) -> DgResult<()> {
        if !self.is_open() {
            return Err(DgError::NotConnected);
        }
        if self.stall_writes.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            return Err(DgError::Transport(format!(
                "mock write exceeded {:?}",
                timeout
            )));
        }

        let text = String::from_utf8_lossy(bytes);
        let command = text.trim_end_matches(&['\r', '\n'][..]).to_string();
        self.written.lock().push(command.clone());

        let replies = self.responder.lock().respond(&command);
        self.deliver(replies);
        Ok(())
    }

    fn register_reader(&self, reader: ReaderFn) {
        *self.reader.lock() = Some(reader);
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct SimChannel {
    state: bool,
    inverted: bool,
    delay: f64,
    width: f64,
}

/// Answers the subset of the BNC 565 command set the device model uses.
///
/// Directives answer `ok`, queries answer the stored value, anything else
/// answers `?`. States are reported as `1`/`0` like the real unit.
#[derive(Debug, Clone)]
pub struct Bnc565Simulator {
    channels: Vec<SimChannel>,
    master: bool,
    period: f64,
    keypad_locked: bool,
}

impl Default for Bnc565Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Bnc565Simulator {
    /// Creates a simulator in the factory state.
    pub fn new() -> Self {
        Self {
            channels: (0..CHANNEL_COUNT)
                .map(|i| SimChannel {
                    state: false,
                    inverted: false,
                    delay: (i + 1) as f64 * 1.0e-5,
                    width: 1.0e-6,
                })
                .collect(),
            master: false,
            period: 1.0e-3,
            keypad_locked: true,
        }
    }

    fn reply(&mut self, command: &str) -> Option<String> {
        match command {
            "*IDN?" => return Some("BNC,565-8,SIM0001,2.4.0".to_string()),
            ":INST:FULL?" => return Some("T0, CHA, CHB, CHC, CHD, CHE, CHF, CHG, CHH".to_string()),
            "*RST" => {
                *self = Self::new();
                return Some("ok".to_string());
            }
            ":SYST:KLOCK OFF" => {
                self.keypad_locked = false;
                return Some("ok".to_string());
            }
            ":SYST:KLOCK ON" => {
                self.keypad_locked = true;
                return Some("ok".to_string());
            }
            _ => {}
        }

        let rest = command.strip_prefix(":PULSE")?;
        let digits = rest.find(':')?;
        let channel: usize = rest[..digits].parse().ok()?;
        let (attr, arg) = match rest[digits + 1..].split_once(' ') {
            Some((attr, arg)) => (attr, Some(arg.trim())),
            None => (&rest[digits + 1..], None),
        };

        if channel == 0 {
            return match (attr, arg) {
                ("STATE?", None) => Some(bit(self.master)),
                ("PER?", None) => Some(format_seconds(self.period)),
                ("STATE", Some(v)) => {
                    self.master = parse_switch(v)?;
                    Some("ok".to_string())
                }
                ("PER", Some(v)) => {
                    self.period = v.parse().ok()?;
                    Some("ok".to_string())
                }
                _ => None,
            };
        }

        let ch = self.channels.get_mut(channel.checked_sub(1)?)?;
        match (attr, arg) {
            ("STATE?", None) => Some(bit(ch.state)),
            ("POL?", None) => Some(if ch.inverted { "INV" } else { "NORM" }.to_string()),
            ("DELAY?", None) => Some(format_seconds(ch.delay)),
            ("WIDTH?", None) => Some(format_seconds(ch.width)),
            ("STATE", Some(v)) => {
                ch.state = parse_switch(v)?;
                Some("ok".to_string())
            }
            ("POL", Some(v)) => {
                ch.inverted = match v {
                    "INV" => true,
                    "NORM" => false,
                    _ => return None,
                };
                Some("ok".to_string())
            }
            ("DELAY", Some(v)) => {
                ch.delay = v.parse().ok()?;
                Some("ok".to_string())
            }
            ("WIDTH", Some(v)) => {
                ch.width = v.parse().ok()?;
                Some("ok".to_string())
            }
            ("SYNC", Some(_)) => Some("ok".to_string()),
            _ => None,
        }
    }

    /// Whether the front-panel keypad is locked.
    pub fn keypad_locked(&self) -> bool {
        self.keypad_locked
    }
}

fn bit(on: bool) -> String {
    if on { "1" } else { "0" }.to_string()
}

fn parse_switch(v: &str) -> Option<bool> {
    match v {
        "ON" | "1" => Some(true),
        "OFF" | "0" => Some(false),
        _ => None,
    }
}

impl Responder for Bnc565Simulator {
    fn respond(&mut self, command: &str) -> Vec<String> {
        vec![self.reply(command).unwrap_or_else(|| "?".to_string())]
    }
}
