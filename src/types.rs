use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::sanitize::{sanitize_label_set, Labels};

/// Alert as produced by the rule evaluation side
///
/// Label and annotation names are arbitrary strings here; they are only
/// made Alertmanager-compatible when converted into an [`OutboundAlert`].
///
/// # Example
///
/// ```rust
/// use alert_sender::Alert;
///
/// let alert = Alert::new("HighCPUUsage")
///     .with_label("service", "api-server")
///     .with_label("instance", "prod-1")
///     .with_annotation("summary", "CPU usage above 80%");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Labels identify the alert (used for deduplication and routing)
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Annotations contain additional information (not used for dedup)
    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Start time of the alert
    pub starts_at: DateTime<Utc>,

    /// End time, `None` while the alert is still firing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,

    /// Generator URL (link back to source)
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
}

impl Alert {
    /// Create a new firing alert with the given name
    ///
    /// The `alertname` label is automatically set.
    pub fn new(alertname: &str) -> Self {
        let mut labels = HashMap::new();
        labels.insert("alertname".to_string(), alertname.to_string());

        Self {
            labels,
            ..Self::default()
        }
    }

    /// Add a label to the alert
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// Set generator URL
    pub fn with_generator_url(mut self, url: &str) -> Self {
        self.generator_url = url.to_string();
        self
    }

    /// Set custom start time
    pub fn with_starts_at(mut self, time: DateTime<Utc>) -> Self {
        self.starts_at = time;
        self
    }

    /// Set end time to resolve the alert
    pub fn with_ends_at(mut self, time: DateTime<Utc>) -> Self {
        self.ends_at = Some(time);
        self
    }

    /// Mark the alert as resolved (sets ends_at to now)
    pub fn resolve(mut self) -> Self {
        self.ends_at = Some(Utc::now());
        self
    }
}

impl Default for Alert {
    fn default() -> Self {
        Self {
            labels: HashMap::new(),
            annotations: HashMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            generator_url: String::new(),
        }
    }
}

/// Sanitized alert in the Alertmanager v2 wire shape
///
/// See: <https://prometheus.io/docs/alerting/latest/clients/>
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundAlert {
    pub labels: Labels,
    pub annotations: Labels,
    pub starts_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(rename = "generatorURL", skip_serializing_if = "String::is_empty")]
    pub generator_url: String,
}

impl OutboundAlert {
    /// Whether the alert has not been resolved yet
    pub fn is_firing(&self) -> bool {
        self.ends_at.is_none()
    }
}

impl From<&Alert> for OutboundAlert {
    fn from(alert: &Alert) -> Self {
        Self {
            labels: sanitize_label_set(&alert.labels),
            annotations: sanitize_label_set(&alert.annotations),
            starts_at: alert.starts_at,
            ends_at: alert.ends_at,
            generator_url: alert.generator_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_creation() {
        let alert = Alert::new("TestAlert")
            .with_label("service", "service")
            .with_annotation("description", "Test description");

        assert_eq!(
            alert.labels.get("alertname"),
            Some(&"TestAlert".to_string())
        );
        assert_eq!(alert.labels.get("service"), Some(&"service".to_string()));
        assert_eq!(
            alert.annotations.get("description"),
            Some(&"Test description".to_string())
        );
        assert!(alert.ends_at.is_none());
    }

    #[test]
    fn test_alert_resolve() {
        let alert = Alert::new("TestAlert").resolve();
        assert!(alert.ends_at.is_some());
    }

    #[test]
    fn test_alert_deserializes_from_postable_shape() {
        let alert: Alert = serde_json::from_str(
            r#"{
                "labels": {"alertname": "Disk full", "host name": "db-1"},
                "startsAt": "2024-01-01T00:00:00Z",
                "generatorURL": "http://grafana/alerting/1"
            }"#,
        )
        .unwrap();

        assert_eq!(alert.labels.len(), 2);
        assert!(alert.annotations.is_empty());
        assert!(alert.ends_at.is_none());
        assert_eq!(alert.generator_url, "http://grafana/alerting/1");
    }

    #[test]
    fn test_outbound_alert_sanitizes_labels_and_annotations() {
        let alert = Alert::new("TestAlert")
            .with_label("host name", "db-1")
            .with_annotation("run-book", "http://wiki")
            .with_annotation("", "dropped");

        let outbound = OutboundAlert::from(&alert);

        assert_eq!(outbound.labels.get("alertname"), Some("TestAlert"));
        assert_eq!(outbound.labels.get("hostname"), Some("db-1"));
        assert_eq!(outbound.annotations.get("run_book"), Some("http://wiki"));
        assert_eq!(outbound.annotations.len(), 1);
        assert!(outbound.is_firing());
    }

    #[test]
    fn test_outbound_alert_serialization() {
        let starts_at = "2024-01-01T00:00:00Z".parse().unwrap();
        let ends_at = "2024-01-01T01:00:00Z".parse().unwrap();
        let alert = Alert::new("TestAlert")
            .with_starts_at(starts_at)
            .with_ends_at(ends_at)
            .with_generator_url("http://example.com/alerts/1");

        let json = serde_json::to_value(OutboundAlert::from(&alert)).unwrap();

        assert_eq!(json["labels"]["alertname"], "TestAlert");
        assert_eq!(json["annotations"], serde_json::json!({}));
        assert_eq!(json["startsAt"], "2024-01-01T00:00:00Z");
        assert_eq!(json["endsAt"], "2024-01-01T01:00:00Z");
        assert_eq!(json["generatorURL"], "http://example.com/alerts/1");
    }

    #[test]
    fn test_firing_alert_omits_optional_fields() {
        let json = serde_json::to_value(OutboundAlert::from(&Alert::new("TestAlert"))).unwrap();

        assert!(json.get("endsAt").is_none());
        assert!(json.get("generatorURL").is_none());
    }
}
