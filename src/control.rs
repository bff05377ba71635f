//! Request dispatch for the browser front end.
//!
//! The HTTP server itself lives elsewhere; it hands every `/dg/ctl?...`
//! request to [`Controller::handle`] and writes back the returned body.
//! Payloads ride in the query string as JSON, optionally percent-encoded.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::device::{json, CommitReport, Device};
use crate::error::{DgError, DgResult};

const PREFIX: &str = "/dg/ctl?";

/// One parsed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `?banner`
    Banner,
    /// `?status.json`
    Status,
    /// `?commit.json=<doc>`
    Commit(String),
    /// `?submit.text=<commands>`
    Submit(String),
    /// `?set=<checkboxes>`
    Set(String),
    /// `?events`
    Events,
}

impl Request {
    /// Parses the query part of a `/dg/ctl?...` path.
    pub fn parse(path: &str) -> DgResult<Self> {
        let query = path
            .strip_prefix(PREFIX)
            .ok_or_else(|| DgError::UnknownRequest(path.to_string()))?;

        match query {
            "banner" => return Ok(Request::Banner),
            "status.json" => return Ok(Request::Status),
            "events" => return Ok(Request::Events),
            _ => {}
        }

        if let Some(payload) = query.strip_prefix("commit.json=") {
            Ok(Request::Commit(percent_decode(payload)))
        } else if let Some(payload) = query.strip_prefix("submit.text=") {
            Ok(Request::Submit(percent_decode(payload)))
        } else if let Some(payload) = query.strip_prefix("set=") {
            Ok(Request::Set(percent_decode(payload)))
        } else {
            Err(DgError::UnknownRequest(path.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct SetDoc {
    #[serde(default)]
    checkbox: Vec<CheckboxDoc>,
}

#[derive(Debug, Deserialize)]
struct CheckboxDoc {
    id: Option<String>,
    value: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubmitDoc {
    List(Vec<String>),
    Map(serde_json::Map<String, serde_json::Value>),
}

impl SubmitDoc {
    fn into_commands(self) -> Vec<String> {
        match self {
            SubmitDoc::List(items) => items,
            SubmitDoc::Map(map) => map
                .into_iter()
                .filter_map(|(_, v)| v.as_str().map(str::to_string))
                .collect(),
        }
    }
}

/// Answers front-end requests against one [`Device`].
pub struct Controller {
    device: Arc<Device>,
}

impl Controller {
    /// Wraps a shared device.
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    /// The device this controller drives.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Run one request and return the response body. Never fails; errors
    /// are reported in the body the way the front end expects them.
    pub async fn handle(&self, method: &str, path: &str) -> String {
        debug!(method, path, "Control request");
        let request = match Request::parse(path) {
            Ok(request) => request,
            Err(_) => return format!("dgctl -- unknown request({}, {})", method, path),
        };

        match request {
            Request::Banner => self.banner(),
            Request::Status => self.status().await,
            Request::Commit(payload) => self.commit(&payload).await,
            Request::Submit(payload) => self.submit(&payload).await,
            Request::Set(payload) => self.set(&payload).await,
            Request::Events => "SSE".to_string(),
        }
    }

    fn banner(&self) -> String {
        format!(
            "<h2>BNC 565 V{} S/N {}</h2>",
            env!("CARGO_PKG_VERSION"),
            self.device.identity().idn
        )
    }

    async fn status(&self) -> String {
        let snapshot = self.device.fetch().await;
        match json::to_string(&snapshot) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode status: {}", e);
                String::new()
            }
        }
    }

    async fn commit(&self, payload: &str) -> String {
        let snapshot = match json::from_str(payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Rejected commit payload: {}", e);
                return e.to_string();
            }
        };
        let report = self.device.commit(&snapshot.protocol).await;
        commit_message(&report)
    }

    async fn submit(&self, payload: &str) -> String {
        let commands = match serde_json::from_str::<SubmitDoc>(payload) {
            Ok(doc) => doc.into_commands(),
            Err(e) => {
                warn!("Rejected submit payload: {}", e);
                return e.to_string();
            }
        };

        let mut replies = Vec::new();
        for command in commands.iter().filter(|c| !c.is_empty()) {
            match self.device.send(command).await {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    debug!(command = %command, "Submit failed: {}", e);
                    replies.push("Error".to_string());
                }
            }
        }
        replies.join("\n")
    }

    async fn set(&self, payload: &str) -> String {
        let doc: SetDoc = match serde_json::from_str(payload) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Rejected set payload: {}", e);
                return String::new();
            }
        };

        let mut out = String::new();
        for item in doc.checkbox {
            if let (Some(id), Some(value)) = (item.id.as_deref(), item.value) {
                if id == "switch-connect" {
                    out.push_str(&self.device.switch_connect(value).await);
                }
            }
        }
        out
    }
}

/// Response body for a finished commit.
pub fn commit_message(report: &CommitReport) -> String {
    if report.skipped {
        "COMMIT SUCCESS; trigger is not active".to_string()
    } else if report.failed.is_empty() {
        "COMMIT SUCCESS; (trigger is active)".to_string()
    } else {
        format!(
            "COMMIT FAILED; {} of {} directives not acknowledged: {}",
            report.failed.len(),
            report.attempted,
            report.failed.join(", ")
        )
    }
}

/// Decode `%XX` escapes; malformed escapes pass through untouched. `+` is
/// left alone since JSON exponents use it.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requests() {
        assert_eq!(Request::parse("/dg/ctl?banner").unwrap(), Request::Banner);
        assert_eq!(Request::parse("/dg/ctl?status.json").unwrap(), Request::Status);
        assert_eq!(Request::parse("/dg/ctl?events").unwrap(), Request::Events);
        assert_eq!(
            Request::parse("/dg/ctl?submit.text=[\"*IDN?\"]").unwrap(),
            Request::Submit("[\"*IDN?\"]".to_string())
        );
        assert!(matches!(
            Request::parse("/dg/ctl?bogus"),
            Err(DgError::UnknownRequest(_))
        ));
        assert!(Request::parse("/index.html").is_err());
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("%7B%22a%22%3A1%7D"), "{\"a\":1}");
        assert_eq!(percent_decode("1e+21"), "1e+21");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("plain"), "plain");
    }

    #[test]
    fn test_submit_doc_forms() {
        let list: SubmitDoc = serde_json::from_str(r#"["*IDN?", ""]"#).unwrap();
        assert_eq!(list.into_commands(), vec!["*IDN?", ""]);
        let map: SubmitDoc = serde_json::from_str(r#"{"a":"*RST","b":3}"#).unwrap();
        assert_eq!(map.into_commands(), vec!["*RST"]);
    }

    #[test]
    fn test_commit_messages() {
        let ok = CommitReport {
            attempted: 35,
            ..CommitReport::default()
        };
        assert_eq!(commit_message(&ok), "COMMIT SUCCESS; (trigger is active)");

        let failed = CommitReport {
            attempted: 35,
            failed: vec![":PULSE1:WIDTH 1.000000E-7".to_string()],
            ..CommitReport::default()
        };
        assert!(commit_message(&failed).starts_with("COMMIT FAILED; 1 of 35"));
    }
}
