//! In-memory device model.
//!
//! All times are seconds. Conversion to the microseconds of the JSON
//! encoding happens in [`super::json`], and to the wire notation in
//! [`super::commands`].

use serde::{Deserialize, Serialize};

use super::commands::CHANNEL_COUNT;

/// Output polarity of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    /// `NORM`
    #[default]
    Normal,
    /// `INV`
    Inverted,
}

impl Polarity {
    /// Wire token.
    pub fn token(self) -> &'static str {
        match self {
            Polarity::Normal => "NORM",
            Polarity::Inverted => "INV",
        }
    }

    /// True for [`Polarity::Inverted`].
    pub fn is_inverted(self) -> bool {
        self == Polarity::Inverted
    }
}

/// On/off for a pulse output or the master trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    /// Enabled
    On,
    /// Disabled
    #[default]
    Off,
}

impl Switch {
    /// Wire token, `ON` or `OFF`.
    pub fn token(self) -> &'static str {
        match self {
            Switch::On => "ON",
            Switch::Off => "OFF",
        }
    }

    /// True for [`Switch::On`].
    pub fn is_on(self) -> bool {
        self == Switch::On
    }
}

impl From<bool> for Switch {
    fn from(on: bool) -> Self {
        if on {
            Switch::On
        } else {
            Switch::Off
        }
    }
}

/// Settings of one pulse output.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PulseChannel {
    /// Seconds after T0
    pub delay: f64,
    /// Seconds
    pub width: f64,
    /// Output polarity
    pub polarity: Polarity,
    /// Whether the output is enabled
    pub state: Switch,
}

/// The eight pulse outputs plus the master state and train period.
///
/// `channels[0]` is wire channel 1; wire channel 0 is the master and is
/// represented by `state` and `interval` only.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProtocol {
    /// Pulse outputs in `PULSE1..PULSE8` order.
    pub channels: [PulseChannel; CHANNEL_COUNT],
    /// System (`PULSE0`) run state, i.e. whether the trigger is active.
    pub state: Switch,
    /// Seconds between pulse trains
    pub interval: f64,
}

impl Default for DeviceProtocol {
    fn default() -> Self {
        Self {
            channels: [PulseChannel::default(); CHANNEL_COUNT],
            state: Switch::Off,
            interval: 1.0e-3,
        }
    }
}

impl DeviceProtocol {
    /// Deterministic values served while no device is connected.
    ///
    /// Channel `i` (0-based): delay `i` µs + 0.1 µs, width `(i + 1)` × 0.1 µs,
    /// odd channels inverted.
    pub fn placeholder() -> Self {
        let mut protocol = Self::default();
        for (i, ch) in protocol.channels.iter_mut().enumerate() {
            ch.delay = i as f64 * 1.0e-6 + 0.1e-6;
            ch.width = (i + 1) as f64 * 0.10 * 1.0e-6;
            ch.polarity = if i % 2 == 1 {
                Polarity::Inverted
            } else {
                Polarity::Normal
            };
        }
        protocol
    }

    /// Wire channel number (1-based) for a slot in `channels`.
    pub fn wire_channel(index: usize) -> usize {
        index + 1
    }
}

/// Identification strings from the last successful exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// `*IDN?` reply
    pub idn: String,
    /// `:INST:FULL?` reply
    pub instrument_full: String,
}

impl DeviceIdentity {
    /// False while the identity is still the placeholder.
    pub fn is_known(&self) -> bool {
        !self.idn.is_empty()
    }
}

/// Everything the request layer sees: identity plus protocol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    /// Instrument identity
    pub identity: DeviceIdentity,
    /// Pulse layout and trigger state
    pub protocol: DeviceProtocol,
}

impl DeviceSnapshot {
    /// Values reported when no link is open.
    pub fn placeholder() -> Self {
        Self {
            identity: DeviceIdentity {
                idn: "debug::IDN".to_string(),
                instrument_full: "debug::inst::full".to_string(),
            },
            protocol: DeviceProtocol::placeholder(),
        }
    }
}
