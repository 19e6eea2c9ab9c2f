use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct IngestionWarning {
    pub team_id: i32,
    pub source: String,
    #[serde(rename = "type")]
    pub warning_type: String,
    pub details: String,
    #[serde(serialize_with = "super::serialize_datetime")]
    pub timestamp: DateTime<Utc>, // CH formatted timestamp
}

impl IngestionWarning {
    pub fn new(
        team_id: i32,
        source: String,
        warning_type: String,
        details: HashMap<String, Value>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        let details = serde_json::to_string(&details).expect("Failed to serialize details");
        Self {
            team_id,
            source,
            warning_type,
            details,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn details_are_stringified() {
        let mut details = HashMap::new();
        details.insert("eventUuid".to_string(), json!("u1"));
        let warning = IngestionWarning::new(
            1,
            "plugin-server".to_string(),
            "invalid_heatmap_data".to_string(),
            details,
            None,
        );

        let serialized = serde_json::to_value(&warning).unwrap();
        assert_eq!(serialized["type"], "invalid_heatmap_data");
        assert_eq!(serialized["source"], "plugin-server");
        // details is a JSON string, not a nested object
        let details: Value =
            serde_json::from_str(serialized["details"].as_str().unwrap()).unwrap();
        assert_eq!(details["eventUuid"], "u1");
    }
}
