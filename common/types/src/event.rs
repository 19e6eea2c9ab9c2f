use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{ProjectId, TeamId};

// The event shape produced onto the ingestion topic. SDKs are sloppy about
// types here, so several fields are looser than you'd hope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(
        alias = "$token",
        alias = "api_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    // Kept as a string and parsed by the pipeline, so that a bad uuid is a
    // counted drop rather than an undecodable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub event: String,
    #[serde(alias = "$distinct_id", skip_serializing_if = "Option::is_none")]
    pub distinct_id: Option<Value>, // SDKs send arbitrary values as distinct_id
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>, // Parsed by the pipeline, see timestamp.rs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    // We've seen string offsets come in from older SDKs, so this is coerced
    // rather than typed as an integer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<Value>,
    #[serde(rename = "$set", skip_serializing_if = "Option::is_none")]
    pub set: Option<HashMap<String, Value>>,
    #[serde(rename = "$set_once", skip_serializing_if = "Option::is_none")]
    pub set_once: Option<HashMap<String, Value>>,
}

impl RawEvent {
    pub fn extract_token(&self) -> Option<String> {
        match &self.token {
            Some(value) => Some(value.clone()),
            None => self
                .properties
                .get("token")
                .and_then(Value::as_str)
                .map(String::from),
        }
    }

    /// Extracts, stringifies and trims the distinct_id to a 200 chars String.
    /// SDKs send the distinct_id either in the root field or as a property,
    /// and can send string, number, array, or map values. We best-effort
    /// stringify complex values, and make sure it's not longer than 200 chars.
    pub fn extract_distinct_id(&self) -> Option<String> {
        let value = match &self.distinct_id {
            None | Some(Value::Null) => match self.properties.get("distinct_id") {
                None | Some(Value::Null) => return None,
                Some(id) => id,
            },
            Some(id) => id,
        };

        let distinct_id = value
            .as_str()
            .map(|s| s.to_owned())
            .unwrap_or_else(|| value.to_string());
        Some(match distinct_id.len() {
            0..=200 => distinct_id,
            _ => distinct_id.chars().take(200).collect(),
        })
    }

    pub fn extract_offset(&self) -> Option<i64> {
        self.offset.as_ref().and_then(Value::as_i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonMode {
    Full,
    Propertyless,
    ForceUpgrade,
}

// The enriched record emitted onto the ClickHouse-bound events topic.
// Timestamps are pre-formatted strings because that's what the table sink
// expects, see formats.rs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseEvent {
    pub uuid: Uuid,
    pub team_id: TeamId,
    pub project_id: ProjectId,
    pub event: String,
    pub distinct_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    pub timestamp: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_properties: Option<String>,
    pub person_mode: PersonMode,
}
