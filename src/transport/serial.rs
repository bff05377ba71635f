//! Serial transport backed by `tokio-serial`.
//!
//! The port is split into halves on open. The write half sits behind an
//! async mutex and is only touched by [`Transport::write`]; the read half is
//! moved into a delivery task that forwards every chunk to the registered
//! reader until the shutdown signal fires or the port reports an error.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::{ReaderFn, Transport};
use crate::error::{DgError, DgResult};
use crate::shutdown::{cancelled, ShutdownBarrier};

const READ_CHUNK: usize = 256;

/// Transport over a real serial port.
pub struct SerialTransport {
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    reader: Arc<SyncMutex<Option<ReaderFn>>>,
    delivery: Mutex<Option<ShutdownBarrier>>,
    open: Arc<AtomicBool>,
    grace: Duration,
}

impl SerialTransport {
    /// `grace` bounds how long `close` waits for the delivery task.
    pub fn new(grace: Duration) -> Self {
        Self {
            writer: Mutex::new(None),
            reader: Arc::new(SyncMutex::new(None)),
            delivery: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            grace,
        }
    }
}

async fn delivery_loop(
    mut port: ReadHalf<SerialStream>,
    reader: Arc<SyncMutex<Option<ReaderFn>>>,
    open: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = cancelled(&mut stop) => break,
            read = port.read(&mut buf) => match read {
                Ok(0) => {
                    warn!("Serial port reported EOF");
                    open.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(n) => {
                    // Clone out so the callback never runs under our lock.
                    let callback = reader.lock().clone();
                    if let Some(callback) = callback {
                        callback(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    warn!("Serial read error: {}", e);
                    open.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
    debug!("Serial delivery task stopped");
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    async fn open(&self, port: &str, baud_rate: u32) -> DgResult<()> {
        if self.is_open() {
            self.close().await;
        }

        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DgError::Transport(format!("{} for tty device '{}'", e, port)))?;

        let (read_half, write_half) = tokio::io::split(stream);

        let mut barrier = ShutdownBarrier::new("serial-delivery");
        let stop = barrier.subscribe();
        barrier.track(tokio::spawn(delivery_loop(
            read_half,
            self.reader.clone(),
            self.open.clone(),
            stop,
        )));

        *self.writer.lock().await = Some(write_half);
        *self.delivery.lock().await = Some(barrier);
        self.open.store(true, Ordering::SeqCst);

        info!(port, baud_rate, "Serial port opened");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write(&self, bytes: &[u8], timeout: Duration) -> DgResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(DgError::NotConnected)?;

        let result = tokio::time::timeout(timeout, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DgError::Transport(format!("serial write failed: {}", e))),
            Err(_) => Err(DgError::Transport(format!(
                "serial write exceeded {:?}",
                timeout
            ))),
        }
    }

    fn register_reader(&self, reader: ReaderFn) {
        *self.reader.lock() = Some(reader);
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);

        // Stop delivery before the port goes away.
        if let Some(mut barrier) = self.delivery.lock().await.take() {
            barrier.shutdown(self.grace).await;
        }
        if self.writer.lock().await.take().is_some() {
            info!("Serial port closed");
        }
    }
}
