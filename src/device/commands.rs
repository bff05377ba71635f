//! BNC 565 command vocabulary.
//!
//! Channels 1..=8 are the pulse outputs; channel 0 is the master/trigger
//! (T0). Times on the wire are seconds in scientific notation. Directives
//! answer `ok`; queries answer the value or `?`.

use crate::device::protocol::{DeviceProtocol, Polarity, Switch};
use crate::error::{DgError, DgResult};

/// Pulse outputs on the instrument, `PULSE1` to `PULSE8`.
pub const CHANNEL_COUNT: usize = 8;

/// Reply token for an accepted directive.
pub const ACK: &str = "ok";

/// Reply token for a rejected query or directive.
pub const DEVICE_ERROR: &str = "?";

/// Identification query.
pub const IDN: &str = "*IDN?";
/// Full instrument description query.
pub const INST_FULL: &str = ":INST:FULL?";
/// Factory reset.
pub const RESET: &str = "*RST";
/// Releases the front-panel keypad.
pub const KEYPAD_UNLOCK: &str = ":SYST:KLOCK OFF";
/// System (`PULSE0`) run state query.
pub const MASTER_STATE_QUERY: &str = ":PULSE0:STATE?";
/// System period query.
pub const PERIOD_QUERY: &str = ":PULSE0:PER?";
/// Starts the system trigger.
pub const TRIGGER_ON: &str = ":PULSE0:STATE ON";

/// One per-channel attribute, in fetch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// `STATE`
    State,
    /// `WIDTH`
    Width,
    /// `DELAY`
    Delay,
    /// `POL`
    Polarity,
}

impl Attribute {
    /// Order in which a fetch queries each channel.
    pub const FETCH_ORDER: [Attribute; 4] = [
        Attribute::State,
        Attribute::Width,
        Attribute::Delay,
        Attribute::Polarity,
    ];

    fn mnemonic(self) -> &'static str {
        match self {
            Attribute::State => "STATE",
            Attribute::Width => "WIDTH",
            Attribute::Delay => "DELAY",
            Attribute::Polarity => "POL",
        }
    }
}

/// `:PULSE<n>:<ATTR>?`
pub fn query(channel: usize, attr: Attribute) -> String {
    format!(":PULSE{}:{}?", channel, attr.mnemonic())
}

/// `:PULSEn:STATE ON|OFF`
pub fn set_state(channel: usize, state: Switch) -> String {
    format!(":PULSE{}:STATE {}", channel, state.token())
}

/// `:PULSEn:POL NORM|INV`
pub fn set_polarity(channel: usize, polarity: Polarity) -> String {
    format!(":PULSE{}:POL {}", channel, polarity.token())
}

/// `:PULSEn:DELAY <seconds>`
pub fn set_delay(channel: usize, seconds: f64) -> String {
    format!(":PULSE{}:DELAY {}", channel, format_seconds(seconds))
}

/// `:PULSEn:WIDTH <seconds>`
pub fn set_width(channel: usize, seconds: f64) -> String {
    format!(":PULSE{}:WIDTH {}", channel, format_seconds(seconds))
}

/// `:PULSE0:PER <seconds>`
pub fn set_period(seconds: f64) -> String {
    format!(":PULSE0:PER {}", format_seconds(seconds))
}

/// Seconds in the scientific notation the unit accepts, e.g. `1.100000E-6`.
pub fn format_seconds(seconds: f64) -> String {
    format!("{:.6E}", seconds)
}

/// Directive sequence for a commit: per channel state, polarity, delay,
/// width; then the train period, keypad unlock, and master trigger on.
pub fn commit_directives(protocol: &DeviceProtocol) -> Vec<String> {
    let mut out = Vec::with_capacity(CHANNEL_COUNT * 4 + 3);
    for (i, ch) in protocol.channels.iter().enumerate() {
        let n = DeviceProtocol::wire_channel(i);
        out.push(set_state(n, ch.state));
        out.push(set_polarity(n, ch.polarity));
        out.push(set_delay(n, ch.delay));
        out.push(set_width(n, ch.width));
    }
    out.push(set_period(protocol.interval));
    out.push(KEYPAD_UNLOCK.to_string());
    out.push(TRIGGER_ON.to_string());
    out
}

/// `:PULSEn:SYNC <source>`, where the source is a channel name such as `CHA`.
pub fn set_sync(channel: usize, source: &str) -> String {
    format!(":PULSE{}:SYNC {}", channel, source)
}

/// Factory layout applied after `*RST`: 1 µs pulses stepped 10 µs apart.
pub fn reset_directives() -> Vec<String> {
    let mut out = Vec::with_capacity(CHANNEL_COUNT * 4);
    for n in 1..=CHANNEL_COUNT {
        out.push(set_width(n, 1.0e-6));
        out.push(set_delay(n, n as f64 * 1.0e-5));
        out.push(set_polarity(n, Polarity::Normal));
        out.push(set_state(n, Switch::On));
    }
    out
}

/// Channel carrying the 1 µs trigger-out pulse.
pub const TRIGGER_OUT_CHANNEL: usize = 5;

/// Channel carrying the simulated ion peak.
pub const ION_PEAK_CHANNEL: usize = 6;

/// Trigger-out pulse on channel 5 followed by master trigger on. Each step
/// must be acknowledged before the next is sent.
pub fn reset_trigger_chain() -> Vec<String> {
    vec![
        set_sync(TRIGGER_OUT_CHANNEL, "CHA"),
        set_width(TRIGGER_OUT_CHANNEL, 1.0e-6),
        TRIGGER_ON.to_string(),
    ]
}

/// Simulated ion peak: a 4 ns inverted pulse 1.8 µs after channel D, then
/// keypad unlock.
pub fn ion_peak_directives() -> Vec<String> {
    vec![
        set_sync(ION_PEAK_CHANNEL, "CHD"),
        set_state(ION_PEAK_CHANNEL, Switch::On),
        set_polarity(ION_PEAK_CHANNEL, Polarity::Inverted),
        set_width(ION_PEAK_CHANNEL, 4.0e-9),
        set_delay(ION_PEAK_CHANNEL, 1.8e-6),
        KEYPAD_UNLOCK.to_string(),
    ]
}

fn malformed(command: &str, reply: &str) -> DgError {
    DgError::MalformedReply {
        command: command.to_string(),
        reply: reply.to_string(),
    }
}

/// Reject the device's `?` error token and empty replies.
pub fn check_reply<'a>(command: &str, reply: &'a str) -> DgResult<&'a str> {
    let trimmed = reply.trim();
    if trimmed.is_empty() || trimmed.starts_with(DEVICE_ERROR) {
        return Err(malformed(command, reply));
    }
    Ok(trimmed)
}

/// Parses a time reply in seconds.
pub fn parse_seconds(command: &str, reply: &str) -> DgResult<f64> {
    let value: f64 = check_reply(command, reply)?
        .parse()
        .map_err(|_| malformed(command, reply))?;
    if !value.is_finite() || value < 0.0 {
        return Err(malformed(command, reply));
    }
    Ok(value)
}

/// State replies come back as `1`/`0` or `ON`/`OFF`.
pub fn parse_switch(command: &str, reply: &str) -> DgResult<Switch> {
    let text = check_reply(command, reply)?;
    if text.eq_ignore_ascii_case("ON") {
        return Ok(Switch::On);
    }
    if text.eq_ignore_ascii_case("OFF") {
        return Ok(Switch::Off);
    }
    match text.parse::<i64>() {
        Ok(0) => Ok(Switch::Off),
        Ok(_) => Ok(Switch::On),
        Err(_) => Err(malformed(command, reply)),
    }
}

/// Parses a `NORM`/`INV` reply.
pub fn parse_polarity(command: &str, reply: &str) -> DgResult<Polarity> {
    let text = check_reply(command, reply)?.to_ascii_uppercase();
    match text.as_str() {
        "NORM" | "NORMAL" => Ok(Polarity::Normal),
        "INV" | "INVERTED" => Ok(Polarity::Inverted),
        _ => Err(malformed(command, reply)),
    }
}
