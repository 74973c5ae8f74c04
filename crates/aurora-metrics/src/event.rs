//! Metric events produced by request handling.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One recorded observation.
///
/// Events are immutable once built; `timestamp_millis` is the wall-clock
/// time the observation was made and drives retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    pub timestamp_millis: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl MetricEvent {
    /// Creates an event stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self::at(now_millis(), name)
    }

    pub fn at(timestamp_millis: i64, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp_millis,
            duration_millis: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_millis = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Age of the event relative to `now_millis`; negative for future stamps.
    pub fn age_millis(&self, now_millis: i64) -> i64 {
        now_millis.saturating_sub(self.timestamp_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let event = MetricEvent::at(1_000, "http.request")
            .with_duration(Duration::from_millis(42))
            .with_tag("route", "/iceberg/v1/config")
            .with_tag("status", "200");

        assert_eq!(event.name, "http.request");
        assert_eq!(event.duration_millis, Some(42));
        assert_eq!(event.tag("status"), Some("200"));
        assert_eq!(event.age_millis(1_500), 500);
    }

    #[test]
    fn test_json_shape() {
        let event = MetricEvent::at(7, "scan");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"name": "scan", "timestamp_millis": 7}));

        let parsed: MetricEvent =
            serde_json::from_str(r#"{"name":"scan","timestamp_millis":7,"tags":{"a":"b"}}"#)
                .unwrap();
        assert_eq!(parsed.tag("a"), Some("b"));
    }

    #[test]
    fn test_now_is_recent() {
        let event = MetricEvent::new("tick");
        assert!(event.age_millis(now_millis()) >= 0);
        assert!(event.age_millis(now_millis()) < 60_000);
    }
}
