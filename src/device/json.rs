//! JSON shape exchanged with the browser front end.
//!
//! ```json
//! {
//!   "idn": "BNC,565-8,...",
//!   "inst_full": "T0, CHA, ...",
//!   "protocols": {
//!     "state": "on",
//!     "interval": 1000.0,
//!     "protocol": [
//!       { "index": 0,
//!         "pulses": [ { "delay": 0.1, "width": 0.1, "polarity": "normal",
//!                       "inv": "false", "state": "on" } ] }
//!     ]
//!   }
//! }
//! ```
//!
//! `interval`, `delay` and `width` are microseconds here and seconds
//! everywhere else. `inv` is written as the string `"true"`/`"false"`, which
//! is what the status page compares against.
//!
//! Decoding takes what the commit form posts. Numbers may arrive as input
//! strings (`"1.5"`), `state` as a bool, an integer or `"on"`/`"off"`, and
//! `polarity` as a checkbox bool or `"normal"`/`"inverted"`. Missing or empty
//! fields fall back to defaults and extra pulses are ignored. Times must be
//! finite and non-negative; anything else rejects the whole document.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use super::commands::CHANNEL_COUNT;
use super::protocol::{DeviceIdentity, DeviceProtocol, DeviceSnapshot, Polarity, PulseChannel, Switch};
use crate::error::DgResult;

/// The front end works in microseconds.
pub const MICROS_PER_SECOND: f64 = 1.0e6;

/// Seconds to front-end microseconds.
pub fn seconds_to_micros(seconds: f64) -> f64 {
    seconds * MICROS_PER_SECOND
}

/// Front-end microseconds to seconds.
pub fn micros_to_seconds(micros: f64) -> f64 {
    micros / MICROS_PER_SECOND
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SnapshotOut {
    idn: String,
    inst_full: String,
    protocols: ProtocolsOut,
}

#[derive(Debug, Serialize)]
struct ProtocolsOut {
    state: Switch,
    interval: f64,
    protocol: Vec<ProtocolOut>,
}

#[derive(Debug, Serialize)]
struct ProtocolOut {
    index: u32,
    pulses: Vec<PulseOut>,
}

#[derive(Debug, Serialize)]
struct PulseOut {
    delay: f64,
    width: f64,
    polarity: Polarity,
    inv: &'static str,
    state: Switch,
}

impl From<&PulseChannel> for PulseOut {
    fn from(ch: &PulseChannel) -> Self {
        Self {
            delay: seconds_to_micros(ch.delay),
            width: seconds_to_micros(ch.width),
            polarity: ch.polarity,
            inv: if ch.polarity.is_inverted() { "true" } else { "false" },
            state: ch.state,
        }
    }
}

fn to_doc(snapshot: &DeviceSnapshot) -> SnapshotOut {
    let p = &snapshot.protocol;
    SnapshotOut {
        idn: snapshot.identity.idn.clone(),
        inst_full: snapshot.identity.instrument_full.clone(),
        protocols: ProtocolsOut {
            state: p.state,
            interval: seconds_to_micros(p.interval),
            protocol: vec![ProtocolOut {
                index: 0,
                pulses: p.channels.iter().map(PulseOut::from).collect(),
            }],
        },
    }
}

/// Encodes a snapshot in the front-end shape.
pub fn to_value(snapshot: &DeviceSnapshot) -> DgResult<serde_json::Value> {
    Ok(serde_json::to_value(to_doc(snapshot))?)
}

/// Encodes a snapshot as pretty-printed JSON text.
pub fn to_string(snapshot: &DeviceSnapshot) -> DgResult<String> {
    Ok(serde_json::to_string_pretty(&to_doc(snapshot))?)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Any scalar a form field can turn into.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn loose<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Loose>, D::Error> {
    Ok(match Option::<Loose>::deserialize(d)? {
        Some(Loose::Text(s)) if s.trim().is_empty() => None,
        other => other,
    })
}

/// Microseconds; must be finite and non-negative.
fn loose_micros<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let value = match loose(d)? {
        None => return Ok(None),
        Some(Loose::Int(i)) => i as f64,
        Some(Loose::Float(f)) => f,
        Some(Loose::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("'{}' is not a number", s)))?,
        Some(Loose::Bool(b)) => {
            return Err(de::Error::custom(format!("expected a time, got {}", b)))
        }
    };
    if !value.is_finite() || value < 0.0 {
        return Err(de::Error::custom(format!(
            "time must be finite and non-negative, got {}",
            value
        )));
    }
    Ok(Some(value))
}

fn loose_index<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    match loose(d)? {
        None => Ok(None),
        Some(Loose::Int(i)) => Ok(Some(i)),
        Some(Loose::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("'{}' is not an index", s))),
        Some(other) => Err(de::Error::custom(format!("bad index {:?}", other))),
    }
}

fn loose_switch<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Switch>, D::Error> {
    match loose(d)? {
        None => Ok(None),
        Some(Loose::Bool(b)) => Ok(Some(Switch::from(b))),
        Some(Loose::Int(i)) => Ok(Some(Switch::from(i != 0))),
        Some(Loose::Float(f)) => Ok(Some(Switch::from(f != 0.0))),
        Some(Loose::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Ok(Some(Switch::On)),
            "off" | "false" | "0" => Ok(Some(Switch::Off)),
            _ => Err(de::Error::custom(format!("'{}' is not on/off", s))),
        },
    }
}

/// Polarity, or the checkbox bool where `true` means inverted.
fn loose_polarity<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Polarity>, D::Error> {
    let inverted = |on: bool| if on { Polarity::Inverted } else { Polarity::Normal };
    match loose(d)? {
        None => Ok(None),
        Some(Loose::Bool(b)) => Ok(Some(inverted(b))),
        Some(Loose::Int(i)) => Ok(Some(inverted(i != 0))),
        Some(Loose::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "inverted" | "inv" | "true" | "1" => Ok(Some(Polarity::Inverted)),
            "normal" | "norm" | "false" | "0" => Ok(Some(Polarity::Normal)),
            _ => Err(de::Error::custom(format!("'{}' is not a polarity", s))),
        },
        Some(other) => Err(de::Error::custom(format!("bad polarity {:?}", other))),
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotIn {
    #[serde(default)]
    idn: String,
    #[serde(default)]
    inst_full: String,
    protocols: ProtocolsIn,
}

#[derive(Debug, Deserialize)]
struct ProtocolsIn {
    #[serde(default, deserialize_with = "loose_switch")]
    state: Option<Switch>,
    #[serde(default, deserialize_with = "loose_micros")]
    interval: Option<f64>,
    #[serde(default)]
    protocol: Vec<ProtocolIn>,
}

#[derive(Debug, Deserialize)]
struct ProtocolIn {
    #[serde(default, deserialize_with = "loose_index")]
    index: Option<i64>,
    #[serde(default)]
    pulses: Vec<PulseIn>,
}

#[derive(Debug, Deserialize)]
struct PulseIn {
    #[serde(default, deserialize_with = "loose_micros")]
    delay: Option<f64>,
    #[serde(default, deserialize_with = "loose_micros")]
    width: Option<f64>,
    #[serde(default, deserialize_with = "loose_polarity")]
    polarity: Option<Polarity>,
    #[serde(default, deserialize_with = "loose_polarity")]
    inv: Option<Polarity>,
    #[serde(default, deserialize_with = "loose_switch")]
    state: Option<Switch>,
}

impl From<&PulseIn> for PulseChannel {
    fn from(doc: &PulseIn) -> Self {
        Self {
            delay: micros_to_seconds(doc.delay.unwrap_or_default()),
            width: micros_to_seconds(doc.width.unwrap_or_default()),
            polarity: doc.polarity.or(doc.inv).unwrap_or_default(),
            state: doc.state.unwrap_or_default(),
        }
    }
}

/// Decodes a front-end document from text.
pub fn from_str(text: &str) -> DgResult<DeviceSnapshot> {
    let doc: SnapshotIn = serde_json::from_str(text)?;
    Ok(from_doc(doc))
}

/// Decodes a front-end document already parsed into a value.
pub fn from_value(value: serde_json::Value) -> DgResult<DeviceSnapshot> {
    let doc: SnapshotIn = serde_json::from_value(value)?;
    Ok(from_doc(doc))
}

fn from_doc(doc: SnapshotIn) -> DeviceSnapshot {
    let mut protocol = DeviceProtocol {
        state: doc.protocols.state.unwrap_or_default(),
        ..DeviceProtocol::default()
    };
    if let Some(interval) = doc.protocols.interval {
        protocol.interval = micros_to_seconds(interval);
    }

    let entries = &doc.protocols.protocol;
    let entry = entries
        .iter()
        .find(|p| p.index.unwrap_or(0) == 0)
        .or_else(|| entries.first());

    if let Some(entry) = entry {
        for (slot, pulse) in protocol
            .channels
            .iter_mut()
            .zip(entry.pulses.iter().take(CHANNEL_COUNT))
        {
            *slot = PulseChannel::from(pulse);
        }
    }

    DeviceSnapshot {
        identity: DeviceIdentity {
            idn: doc.idn,
            instrument_full: doc.inst_full,
        },
        protocol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1e-9)
    }

    #[test]
    fn test_encode_shape_uses_micros() {
        let snapshot = DeviceSnapshot::placeholder();
        let value = to_value(&snapshot).unwrap();

        assert_eq!(value["idn"], "debug::IDN");
        assert_eq!(value["inst_full"], "debug::inst::full");
        assert!(close(value["protocols"]["interval"].as_f64().unwrap(), 1000.0));

        let pulses = value["protocols"]["protocol"][0]["pulses"].as_array().unwrap();
        assert_eq!(pulses.len(), 8);
        assert!(close(pulses[1]["delay"].as_f64().unwrap(), 1.1));
        assert!(close(pulses[1]["width"].as_f64().unwrap(), 0.2));
        assert_eq!(pulses[1]["polarity"], "inverted");
        assert_eq!(pulses[0]["state"], "off");
    }

    #[test]
    fn test_encode_emits_inv_string_for_status_page() {
        let value = to_value(&DeviceSnapshot::placeholder()).unwrap();
        let pulses = value["protocols"]["protocol"][0]["pulses"].as_array().unwrap();

        assert_eq!(pulses[0]["inv"], "false");
        assert_eq!(pulses[1]["inv"], "true");
    }

    #[test]
    fn test_round_trip() {
        let mut snapshot = DeviceSnapshot::placeholder();
        snapshot.protocol.state = Switch::On;
        snapshot.protocol.interval = 2.5e-4;
        snapshot.protocol.channels[3] = PulseChannel {
            delay: 1.8e-6,
            width: 4.0e-9,
            polarity: Polarity::Inverted,
            state: Switch::On,
        };

        let decoded = from_str(&to_string(&snapshot).unwrap()).unwrap();
        assert_eq!(decoded.identity, snapshot.identity);
        assert_eq!(decoded.protocol.state, Switch::On);
        assert!(close(decoded.protocol.interval, 2.5e-4));
        for (a, b) in decoded.protocol.channels.iter().zip(&snapshot.protocol.channels) {
            assert!(close(a.delay, b.delay), "{} vs {}", a.delay, b.delay);
            assert!(close(a.width, b.width), "{} vs {}", a.width, b.width);
            assert_eq!(a.polarity, b.polarity);
            assert_eq!(a.state, b.state);
        }
    }

    #[test]
    fn test_micros_conversion_inverts() {
        for s in [0.0, 1.0e-9, 1.1e-6, 2.5e-4, 1.0] {
            assert!(close(micros_to_seconds(seconds_to_micros(s)), s));
        }
    }

    #[test]
    fn test_decode_commit_form_payload() {
        // As posted by the commit form: input values are strings,
        // checkboxes are bools, the master state is an integer.
        let text = r#"{"protocols":{"interval":"1000","state":1,"protocol":[
            {"index":"0","pulses":[
                {"delay":"1.1","width":"0.2","polarity":true,"state":true},
                {"delay":"2","width":"0.5","polarity":false,"state":false},
                {"delay":0.0,"width":0.0,"polarity":false,"state":0}
            ]}]}}"#;

        let snapshot = from_str(text).unwrap();
        let p = &snapshot.protocol;
        assert_eq!(p.state, Switch::On);
        assert!(close(p.interval, 1.0e-3));
        assert!(close(p.channels[0].delay, 1.1e-6));
        assert!(close(p.channels[0].width, 2.0e-7));
        assert_eq!(p.channels[0].polarity, Polarity::Inverted);
        assert_eq!(p.channels[0].state, Switch::On);
        assert!(close(p.channels[1].delay, 2.0e-6));
        assert_eq!(p.channels[1].polarity, Polarity::Normal);
        assert_eq!(p.channels[1].state, Switch::Off);
        assert_eq!(p.channels[2].state, Switch::Off);
    }

    #[test]
    fn test_decode_legacy_inv_and_short_pulse_list() {
        let doc = json!({
            "protocols": {
                "interval": 500.0,
                "protocol": [
                    { "index": 0, "pulses": [
                        { "delay": 1.0, "width": 0.5, "inv": true },
                        { "delay": 2.0, "width": 0.5, "inv": "false" },
                        { "delay": 3.0, "width": "", "inv": "true" }
                    ]}
                ]
            }
        });

        let snapshot = from_value(doc).unwrap();
        let p = &snapshot.protocol;
        assert!(close(p.interval, 5.0e-4));
        assert_eq!(p.channels[0].polarity, Polarity::Inverted);
        assert!(close(p.channels[0].delay, 1.0e-6));
        assert_eq!(p.channels[1].polarity, Polarity::Normal);
        assert_eq!(p.channels[2].polarity, Polarity::Inverted);
        assert_eq!(p.channels[2].width, 0.0);
        assert_eq!(p.channels[3], PulseChannel::default());
        assert!(snapshot.identity.idn.is_empty());
    }

    #[test]
    fn test_decode_ignores_extra_pulses_and_picks_index_zero() {
        let pulses: Vec<_> = (0..12).map(|i| json!({ "delay": i as f64, "width": 1.0 })).collect();
        let doc = json!({
            "protocols": {
                "protocol": [
                    { "index": 1, "pulses": [ { "delay": 99.0 } ] },
                    { "index": 0, "pulses": pulses }
                ]
            }
        });

        let p = from_value(doc).unwrap().protocol;
        assert!(close(p.channels[7].delay, 7.0e-6));
        assert!(close(p.channels[0].delay, 0.0));
        assert!(close(p.interval, 1.0e-3));
    }

    #[test]
    fn test_decode_rejects_negative_and_non_finite_times() {
        let negative = json!({ "protocols": { "protocol": [
            { "index": 0, "pulses": [ { "delay": -5.0, "width": -1.0 } ] }
        ]}});
        assert!(from_value(negative).is_err());

        let nan = json!({ "protocols": { "protocol": [
            { "index": 0, "pulses": [ { "delay": "NaN", "width": 1.0 } ] }
        ]}});
        assert!(from_value(nan).is_err());

        let interval = json!({ "protocols": { "interval": "-1" } });
        assert!(from_value(interval).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_protocols_and_garbage() {
        assert!(from_str(r#"{"idn":"x"}"#).is_err());
        assert!(from_str("not json").is_err());
        assert!(from_str(r#"{"protocols":{"interval":"soon"}}"#).is_err());
        assert!(from_str(r#"{"protocols":{"state":"maybe"}}"#).is_err());
    }
}
