//! Activity event types.
//!
//! One [`ActivityEvent`] is one line of user-facing progress for a run. The
//! wire shape is fixed: `timestamp` in epoch milliseconds, lowercase
//! `phase`, a free-form `type` sub-label, a human message and an optional
//! `data` map.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pipeline stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityPhase {
    Init,
    Upload,
    Generators,
    Evaluators,
    Aggregation,
    Result,
    Error,
}

impl ActivityPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Upload => "upload",
            Self::Generators => "generators",
            Self::Evaluators => "evaluators",
            Self::Aggregation => "aggregation",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ActivityPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "init" => Ok(Self::Init),
            "upload" => Ok(Self::Upload),
            "generators" => Ok(Self::Generators),
            "evaluators" => Ok(Self::Evaluators),
            "aggregation" => Ok(Self::Aggregation),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// A single progress record for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub phase: ActivityPhase,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl ActivityEvent {
    /// Event stamped with the current time.
    pub fn new(phase: ActivityPhase, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            kind: kind.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach one data field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replace the whole data map. A non-object value is stored under `value`.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = match data {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Some(map)
            }
        };
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, ActivityPhase::Result | ActivityPhase::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_shape() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let event = ActivityEvent::new(ActivityPhase::Generators, "generator_complete", "Generator 2 done")
            .with("index", 2)
            .with("chars", 512)
            .with_timestamp(ts);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["timestamp"], 1_700_000_000_123i64);
        assert_eq!(json["phase"], "generators");
        assert_eq!(json["type"], "generator_complete");
        assert_eq!(json["data"]["index"], 2);
    }

    #[test]
    fn test_data_omitted_when_absent() {
        let event = ActivityEvent::new(ActivityPhase::Init, "pipeline_start", "Starting");
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn test_roundtrip_preserves_millis() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_456).unwrap();
        let event = ActivityEvent::new(ActivityPhase::Error, "run_failed", "boom").with_timestamp(ts);
        let back: ActivityEvent = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(back, event);
        assert!(back.is_terminal());
    }

    #[test]
    fn test_with_data_wraps_scalars() {
        let event = ActivityEvent::new(ActivityPhase::Init, "x", "y").with_data(serde_json::json!(5));
        assert_eq!(event.data.unwrap()["value"], 5);
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!("Evaluators".parse::<ActivityPhase>().unwrap(), ActivityPhase::Evaluators);
        assert!("bogus".parse::<ActivityPhase>().is_err());
    }
}
