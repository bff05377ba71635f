//! Synchronous command/response bridge over an asynchronous byte transport.
//!
//! The transport delivers bytes whenever they arrive; the device model wants
//! to say "send this, give me the answer". [`Bridge`] closes that gap:
//!
//! 1. It registers a reader on the transport that runs every chunk through a
//!    [`LineFramer`] and pushes completed lines into a [`ReplyQueue`].
//! 2. [`Bridge::send`] takes the send lock, drains stale lines, arms the wake
//!    signal, writes the command with a bounded write timeout, then waits a
//!    bounded time for the first reply line.
//! 3. [`Bridge::send_expect`] resends the whole command until the reply
//!    matches, up to a caller-supplied attempt budget.
//!
//! Only one exchange is in flight at a time. Nothing here ever retries on
//! its own beyond `send_expect`, and no failure is fatal: the caller gets a
//! typed error and the counters in [`LinkStats`] go up.

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SerialConfig;
use crate::error::{DgError, DgResult};
use crate::framer::LineFramer;
use crate::transport::Transport;

pub mod queue;

pub use queue::{QueuedLine, ReplyQueue};

/// Appended to every command on the wire.
pub const TERMINATOR: &str = "\r\n";

/// Timeout diagnostics. Relaxed atomics; nothing orders against them.
#[derive(Debug, Default)]
pub struct LinkStats {
    write_timeouts: AtomicU64,
    reply_timeouts: AtomicU64,
}

impl LinkStats {
    /// Writes that did not complete within the write bound.
    pub fn write_timeouts(&self) -> u64 {
        self.write_timeouts.load(Ordering::Relaxed)
    }

    /// Commands that got no reply within the reply bound.
    pub fn reply_timeouts(&self) -> u64 {
        self.reply_timeouts.load(Ordering::Relaxed)
    }

    /// Zeroes both counters.
    pub fn reset(&self) {
        self.write_timeouts.store(0, Ordering::Relaxed);
        self.reply_timeouts.store(0, Ordering::Relaxed);
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> LinkCounters {
        LinkCounters {
            write_timeouts: self.write_timeouts(),
            reply_timeouts: self.reply_timeouts(),
        }
    }
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkCounters {
    /// See [`LinkStats::write_timeouts`]
    pub write_timeouts: u64,
    /// See [`LinkStats::reply_timeouts`]
    pub reply_timeouts: u64,
}

/// Write and wait bounds for one exchange.
#[derive(Debug, Clone, Copy)]
pub struct BridgeTimeouts {
    /// Bound on writing the command bytes
    pub write: Duration,
    /// Bound on waiting for the first reply line
    pub reply: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            write: Duration::from_millis(20),
            reply: Duration::from_millis(200),
        }
    }
}

impl From<&SerialConfig> for BridgeTimeouts {
    fn from(cfg: &SerialConfig) -> Self {
        Self {
            write: cfg.write_timeout(),
            reply: cfg.reply_timeout(),
        }
    }
}

/// Serialized command/response channel over one [`Transport`].
pub struct Bridge {
    transport: Arc<dyn Transport>,
    queue: Arc<ReplyQueue>,
    framer: Arc<SyncMutex<LineFramer>>,
    /// Held across the whole write-then-wait sequence.
    send_lock: Mutex<()>,
    stats: Arc<LinkStats>,
    timeouts: BridgeTimeouts,
}

impl Bridge {
    /// Wire a bridge onto `transport`, registering its reader.
    pub fn new(transport: Arc<dyn Transport>, config: &SerialConfig) -> Self {
        let queue = Arc::new(ReplyQueue::new(config.reply_queue_capacity));
        let framer = Arc::new(SyncMutex::new(LineFramer::new(config.max_line_bytes)));

        {
            let queue = queue.clone();
            let framer = framer.clone();
            transport.register_reader(Arc::new(move |bytes: &[u8]| {
                framer.lock().feed(bytes, |line| {
                    let seq = queue.push(line);
                    debug!(seq, "Reply line queued");
                });
            }));
        }

        Self {
            transport,
            queue,
            framer,
            send_lock: Mutex::new(()),
            stats: Arc::new(LinkStats::default()),
            timeouts: BridgeTimeouts::from(config),
        }
    }

    /// Shared counters, also read by the device status.
    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }

    /// Bounds applied to every exchange.
    pub fn timeouts(&self) -> BridgeTimeouts {
        self.timeouts
    }

    /// Whether the underlying transport is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Forget partial input and queued lines, e.g. after reopening the port.
    pub fn reset_link(&self) {
        self.framer.lock().reset();
        self.queue.drain();
        self.stats.reset();
    }

    /// Send one command and return the first reply line.
    ///
    /// `command` is given without its terminator; trailing CR/LF is
    /// stripped before [`TERMINATOR`] is appended.
    pub async fn send(&self, command: &str) -> DgResult<String> {
        if !self.transport.is_open() {
            return Err(DgError::NotConnected);
        }
        let command = command.trim_end_matches(&['\r', '\n'][..]);

        let _guard = self.send_lock.lock().await;
        self.exchange(command).await
    }

    /// Resend `command` until the reply equals `expected`.
    ///
    /// Makes at least one and at most `max_attempts` attempts. Failed
    /// attempts, whether timeouts or wrong replies, are logged and retried
    /// immediately.
    pub async fn send_expect(&self, command: &str, expected: &str, max_attempts: u32) -> bool {
        if !self.transport.is_open() {
            debug!(command, "Not connected, directive skipped");
            return false;
        }
        let attempts = max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.send(command).await {
                Ok(reply) if reply == expected => return true,
                Ok(reply) => {
                    debug!(command, attempt, reply = %reply, "Unexpected reply");
                }
                Err(DgError::NotConnected) => return false,
                Err(e) => {
                    debug!(command, attempt, "Attempt failed: {}", e);
                }
            }
        }

        warn!(command, attempts, expected, "Directive not acknowledged");
        false
    }

    /// Write-then-wait under the send lock.
    async fn exchange(&self, command: &str) -> DgResult<String> {
        for stale in self.queue.drain() {
            warn!(seq = stale.seq, line = %stale.text, "Discarding unsolicited line before send");
        }

        // Armed before the write so a fast reply cannot slip past.
        let notified = self.queue.notify().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let wire = format!("{}{}", command, TERMINATOR);
        if let Err(e) = self
            .transport
            .write(wire.as_bytes(), self.timeouts.write)
            .await
        {
            warn!(command, "Write failed: {}", e);
            if let DgError::NotConnected = e {
                return Err(DgError::NotConnected);
            }
            self.stats.write_timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(DgError::TransportWriteTimeout(command.to_string()));
        }
        debug!(command, "Sent");

        if self.queue.is_empty()
            && tokio::time::timeout(self.timeouts.reply, notified)
                .await
                .is_err()
        {
            self.stats.reply_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(command, timeout = ?self.timeouts.reply, "Reply timeout");
            return Err(DgError::ReplyTimeout(command.to_string()));
        }

        let Some((reply, extras)) = self.queue.take_first() else {
            warn!(command, "Woken with an empty reply queue");
            return Err(DgError::SpuriousWake(command.to_string()));
        };

        if !extras.is_empty() {
            warn!(
                command,
                count = extras.len() + 1,
                "Got more than one reply, keeping the first"
            );
            for extra in &extras {
                warn!(seq = extra.seq, line = %extra.text, "Discarded extra reply");
            }
        }

        debug!(command, seq = reply.seq, reply = %reply.text, "Received");
        Ok(reply.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    async fn open_bridge(mock: MockTransport) -> (Arc<MockTransport>, Bridge) {
        let mock = Arc::new(mock);
        let bridge = Bridge::new(mock.clone(), &SerialConfig::default());
        mock.open("mock", 115200).await.unwrap();
        (mock, bridge)
    }

    #[tokio::test]
    async fn test_send_returns_first_line() {
        let (mock, bridge) = open_bridge(MockTransport::always("ok")).await;
        assert_eq!(bridge.send(":SYST:KLOCK OFF").await.unwrap(), "ok");
        assert_eq!(mock.commands(), vec![":SYST:KLOCK OFF"]);
    }

    #[tokio::test]
    async fn test_caller_terminator_not_doubled() {
        let (mock, bridge) = open_bridge(MockTransport::always("ok")).await;
        bridge.send("*RST\r\n").await.unwrap();
        assert_eq!(mock.commands(), vec!["*RST"]);
    }

    #[tokio::test]
    async fn test_not_connected_skips_transport() {
        let mock = Arc::new(MockTransport::always("ok"));
        let bridge = Bridge::new(mock.clone(), &SerialConfig::default());

        assert!(matches!(bridge.send("*IDN?").await, Err(DgError::NotConnected)));
        assert!(!bridge.send_expect("*RST", "ok", 10).await);
        assert!(mock.commands().is_empty());
        assert_eq!(bridge.stats().reply_timeouts(), 0);
    }

    #[tokio::test]
    async fn test_chunked_reply() {
        let (_mock, bridge) =
            open_bridge(MockTransport::always("BNC,565,1234,2.0").with_chunk_size(1)).await;
        assert_eq!(bridge.send("*IDN?").await.unwrap(), "BNC,565,1234,2.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_timeout_is_bounded() {
        let (_mock, bridge) = open_bridge(MockTransport::silent()).await;

        let start = tokio::time::Instant::now();
        let result = bridge.send(":PULSE1:WIDTH?").await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(DgError::ReplyTimeout(_))));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300));
        assert_eq!(bridge.stats().reply_timeouts(), 1);
        assert_eq!(bridge.stats().write_timeouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_counts() {
        let (mock, bridge) = open_bridge(MockTransport::always("ok")).await;
        mock.set_stall_writes(true);

        let result = bridge.send("*RST").await;
        assert!(matches!(result, Err(DgError::TransportWriteTimeout(_))));
        assert_eq!(bridge.stats().write_timeouts(), 1);

        // the link stays usable
        mock.set_stall_writes(false);
        assert_eq!(bridge.send("*RST").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_extra_replies_are_dropped() {
        let (_mock, bridge) = open_bridge(MockTransport::new(|_: &str| {
            vec!["first".to_string(), "second".to_string()]
        }))
        .await;

        // Both lines arrive in one chunk, so both are queued before the wake.
        assert_eq!(bridge.send("*IDN?").await.unwrap(), "first");
        assert!(bridge.queue.is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_line_is_not_taken_as_reply() {
        let (mock, bridge) = open_bridge(MockTransport::always("ok")).await;
        mock.inject(b"power-on banner\r\n");
        assert_eq!(bridge.queue.len(), 1);

        assert_eq!(bridge.send("*RST").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_wake_without_line_is_spurious() {
        let queue_slot: Arc<SyncMutex<Option<Arc<ReplyQueue>>>> = Arc::default();
        let slot = queue_slot.clone();
        let (_mock, bridge) = open_bridge(MockTransport::new(move |_: &str| {
            if let Some(queue) = slot.lock().as_ref() {
                queue.notify().notify_waiters();
            }
            Vec::<String>::new()
        }))
        .await;
        *queue_slot.lock() = Some(bridge.queue.clone());

        let result = bridge.send("*IDN?").await;
        assert!(matches!(result, Err(DgError::SpuriousWake(_))), "{:?}", result);
        assert_eq!(bridge.stats().reply_timeouts(), 0);
    }

    #[tokio::test]
    async fn test_closed_during_write_is_not_a_write_timeout() {
        let (mock, bridge) = open_bridge(MockTransport::always("ok")).await;
        mock.close().await;

        // bypass the open check to hit the transport's own refusal
        let result = bridge.exchange("*RST").await;
        assert!(matches!(result, Err(DgError::NotConnected)));
        assert_eq!(bridge.stats().write_timeouts(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_discarded_lines_are_logged() {
        let (mock, bridge) = open_bridge(MockTransport::always("ok")).await;
        mock.inject(b"stray\r\n");
        bridge.send("*RST").await.unwrap();

        assert!(logs_contain("Discarding unsolicited line before send"));
        assert!(logs_contain("stray"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_expect_retries_until_match() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (mock, bridge) = open_bridge(MockTransport::new(move |_: &str| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                vec!["?".to_string()]
            } else {
                vec!["ok".to_string()]
            }
        }))
        .await;

        assert!(bridge.send_expect(":PULSE1:STATE ON", "ok", 10).await);
        assert_eq!(mock.commands().len(), 4);
        assert!(mock.commands().iter().all(|c| c == ":PULSE1:STATE ON"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_expect_exhausts_budget() {
        let (mock, bridge) = open_bridge(MockTransport::always("?")).await;
        assert!(!bridge.send_expect(":PULSE1:STATE ON", "ok", 5).await);
        assert_eq!(mock.commands().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_expect_zero_budget_tries_once() {
        let (mock, bridge) = open_bridge(MockTransport::always("ok")).await;
        assert!(bridge.send_expect("*RST", "ok", 0).await);
        assert_eq!(mock.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_expect_requires_exact_match() {
        let (_mock, bridge) = open_bridge(MockTransport::always("ok ")).await;
        assert!(!bridge.send_expect("*RST", "ok", 3).await);
    }

    #[tokio::test]
    async fn test_concurrent_senders_are_serialized() {
        let (mock, bridge) = open_bridge(
            MockTransport::new(|cmd: &str| vec![format!("re:{}", cmd)])
                .with_latency(Duration::from_millis(5)),
        )
        .await;
        let bridge = Arc::new(bridge);

        let mut handles = Vec::new();
        for i in 0..8 {
            let bridge = bridge.clone();
            handles.push(tokio::spawn(async move {
                let cmd = format!(":PULSE{}:WIDTH?", i % 8 + 1);
                let reply = bridge.send(&cmd).await.unwrap();
                assert_eq!(reply, format!("re:{}", cmd));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(mock.commands().len(), 8);
    }
}
