//! Core library for the `dgctl` delay generator controller.
//!
//! The crate talks to a BNC 565 class digital delay/pulse generator over a
//! serial line. Layers, bottom up:
//!
//! - [`transport`]: raw byte links (physical serial port, in-process mock).
//! - [`framer`]: turns the incoming byte stream into reply lines.
//! - [`bridge`]: one command in flight at a time, bounded waits, retries.
//! - [`device`]: the device model with fetch, commit and reset, plus its
//!   JSON encoding.
//! - [`tick`]: periodic liveness events, independent of the bridge.
//! - [`control`]: request dispatch for the browser front end.
//!
//! Everything is wired together in the binary; there are no globals.

pub mod bridge;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod framer;
pub mod shutdown;
pub mod tick;
pub mod transport;

pub use error::{DgError, DgResult};
