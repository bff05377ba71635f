//! Byte transports the command bridge runs over.
//!
//! A transport is an unbuffered duplex byte stream: writes go out under a
//! caller-supplied bound, and whatever arrives is pushed to a registered
//! reader callback from the transport's own delivery task. Framing and reply
//! matching are not the transport's concern.
//!
//! - [`serial::SerialTransport`] drives a physical port through `tokio-serial`
//!   (feature `serial`).
//! - [`mock::MockTransport`] is in-process and scriptable, and ships a BNC 565
//!   simulator.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DgResult;

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;

pub use mock::{Bnc565Simulator, MockTransport, Responder};
#[cfg(feature = "serial")]
pub use serial::SerialTransport;

/// Callback receiving raw chunks from the delivery task.
pub type ReaderFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Byte-level link to the instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs ("serial", "mock").
    fn name(&self) -> &str;

    /// Open the link and start delivering bytes to the registered reader.
    async fn open(&self, port: &str, baud_rate: u32) -> DgResult<()>;

    /// Whether the link is open.
    fn is_open(&self) -> bool;

    /// Write all of `bytes` within `timeout`.
    async fn write(&self, bytes: &[u8], timeout: Duration) -> DgResult<()>;

    /// Register the callback for incoming bytes. Replaces any earlier one and
    /// survives close/reopen.
    fn register_reader(&self, reader: ReaderFn);

    /// Stop the delivery task, wait for it, then release the link.
    async fn close(&self);
}
