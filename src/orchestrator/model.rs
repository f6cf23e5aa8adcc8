//! Data-layer records the worker reads and writes through the orchestrator.
//!
//! Only the fields the execution engine needs are modelled. Records come
//! from a document store, so identifiers may arrive as `{"$oid": ".."}` and
//! numeric settings as strings.

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::worker::status::ToolRun;

/// Date format used by the data layer. Missing dates are the string `"None"`.
pub const WIRE_DATE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Parse a data-layer date. `"None"`, empty and malformed values are `None`.
pub fn parse_wire_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "None" {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, WIRE_DATE_FORMAT).ok()
}

/// Format a date for the data layer.
pub fn format_wire_date(date: Option<NaiveDateTime>) -> String {
    date.map(|d| d.format(WIRE_DATE_FORMAT).to_string())
        .unwrap_or_else(|| "None".to_string())
}

/// A tool instance: one command to run against one target.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolRecord {
    #[serde(rename = "_id", deserialize_with = "de_object_id")]
    pub id: String,
    /// Command name; also the key into the local tools configuration.
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub command_iid: String,
    /// Schedule group.
    #[serde(default)]
    pub wave: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, deserialize_with = "de_lenient_string")]
    pub port: String,
    #[serde(default = "default_proto")]
    pub proto: String,
    #[serde(default, deserialize_with = "de_status_list")]
    pub status: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

fn default_proto() -> String {
    "tcp".to_string()
}

/// Per-command execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CommandSettings {
    /// Seconds after which a stuck tool is killed; `0` disables it.
    #[serde(default = "default_timeout", deserialize_with = "de_lenient_f64")]
    pub timeout: f64,
    /// Seconds to wait after a successful run before taking more work.
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub sleep_between: f64,
}

fn default_timeout() -> f64 {
    300.0
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            sleep_between: 0.0,
        }
    }
}

impl CommandSettings {
    /// Timeout in whole seconds when it is positive.
    pub fn timeout_secs(&self) -> Option<u64> {
        (self.timeout >= 1.0).then_some(self.timeout as u64)
    }

    pub fn sleep_between(&self) -> Option<std::time::Duration> {
        (self.sleep_between > 0.0).then(|| std::time::Duration::from_secs_f64(self.sleep_between))
    }
}

/// A time window of a schedule group ("wave").
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub wave: String,
    #[serde(default, rename = "dated", deserialize_with = "de_wire_date")]
    pub start: Option<NaiveDateTime>,
    #[serde(default, rename = "datef", deserialize_with = "de_wire_date")]
    pub end: Option<NaiveDateTime>,
}

impl TimeWindow {
    pub fn new(
        wave: impl Into<String>,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Self {
        Self {
            wave: wave.into(),
            start,
            end,
        }
    }

    /// Whether `now` lies inside the window. A missing bound is open.
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        self.start.is_none_or(|start| start <= now) && self.end.is_none_or(|end| now <= end)
    }
}

/// Command line crafted by the orchestrator. Contains the `|outputDir|`
/// placeholder; `extension` is appended to the output path for import.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandLine {
    #[serde(rename = "comm")]
    pub command: String,
    #[serde(rename = "ext", default)]
    pub extension: String,
}

/// Partial update of a tool record. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanner_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datef: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ToolUpdate {
    /// Status, worker and dates of a run.
    pub fn from_run(run: &ToolRun) -> Self {
        Self {
            status: Some(run.status.to_wire()),
            scanner_ip: Some(run.worker.clone().unwrap_or_else(|| "None".to_string())),
            dated: Some(format_wire_date(run.started_at)),
            datef: Some(format_wire_date(run.ended_at)),
            notes: None,
        }
    }

    pub fn notes(notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            ..Self::default()
        }
    }
}

// ── Lenient deserializers ───────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum ObjectId {
    Plain(String),
    Extended {
        #[serde(rename = "$oid")]
        oid: String,
    },
}

fn de_object_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match ObjectId::deserialize(d)? {
        ObjectId::Plain(id) => id,
        ObjectId::Extended { oid } => oid,
    })
}

fn de_lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        serde_json::Value::Object(map) => map
            .get("$oid")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_default(),
        other => other.to_string(),
    })
}

fn de_lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(0.0),
        serde_json::Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        serde_json::Value::Null => Ok(0.0),
        other => Err(serde::de::Error::custom(format!(
            "expected a number, got {other}"
        ))),
    }
}

fn de_status_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) if s.is_empty() => Vec::new(),
        serde_json::Value::String(s) => vec![s],
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    })
}

fn de_wire_date<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.as_deref().and_then(parse_wire_date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn wire_dates() {
        assert_eq!(parse_wire_date("01/05/2024 10:30:00"), Some(at(10, 30)));
        assert_eq!(parse_wire_date("None"), None);
        assert_eq!(parse_wire_date("garbage"), None);
        assert_eq!(format_wire_date(Some(at(9, 5))), "01/05/2024 09:05:00");
        assert_eq!(format_wire_date(None), "None");
    }

    #[test]
    fn tool_record_from_document() {
        let doc = serde_json::json!({
            "_id": {"$oid": "65f0c0ffee"},
            "name": "nmap_top",
            "command_iid": {"$oid": "65f0aaaa"},
            "wave": "Wave 1",
            "ip": "10.0.0.1",
            "port": 443,
            "proto": "tcp",
            "status": "OOT",
        });
        let tool: ToolRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(tool.id, "65f0c0ffee");
        assert_eq!(tool.command_iid, "65f0aaaa");
        assert_eq!(tool.port, "443");
        assert_eq!(tool.status, vec!["OOT"]);
        assert_eq!(tool.scope, "");
    }

    #[test]
    fn command_settings_accept_strings() {
        let settings: CommandSettings =
            serde_json::from_value(serde_json::json!({"timeout": "60", "sleep_between": 2}))
                .unwrap();
        assert_eq!(settings.timeout_secs(), Some(60));
        assert_eq!(
            settings.sleep_between(),
            Some(std::time::Duration::from_secs(2))
        );

        let defaults: CommandSettings = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(defaults.timeout_secs(), Some(300));
        assert_eq!(defaults.sleep_between(), None);

        let disabled: CommandSettings =
            serde_json::from_value(serde_json::json!({"timeout": 0})).unwrap();
        assert_eq!(disabled.timeout_secs(), None);
    }

    #[test]
    fn window_bounds() {
        let window: TimeWindow = serde_json::from_value(serde_json::json!({
            "wave": "Wave 1",
            "dated": "01/05/2024 09:00:00",
            "datef": "None",
        }))
        .unwrap();
        assert_eq!(window.start, Some(at(9, 0)));
        assert_eq!(window.end, None);
        assert!(window.contains(at(23, 0)));
        assert!(!window.contains(at(8, 59)));

        let closed = TimeWindow::new("w", Some(at(9, 0)), Some(at(10, 0)));
        assert!(closed.contains(at(10, 0)));
        assert!(!closed.contains(at(10, 1)));
    }

    #[test]
    fn update_skips_unset_fields() {
        let json = serde_json::to_value(ToolUpdate::notes("binary missing")).unwrap();
        assert_eq!(json, serde_json::json!({"notes": "binary missing"}));
    }
}
