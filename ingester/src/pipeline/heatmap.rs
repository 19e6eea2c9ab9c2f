use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common_kafka::kafka_messages::ingest_warning::IngestionWarning;
use common_types::TeamId;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{EventError, StageResult},
    metric_consts::HEATMAP_EVENTS_EMITTED,
    pipeline::{prep::warning, PreparedEvent},
};

pub const HEATMAP_EVENT: &str = "$$heatmap";

// Coordinates are stored quantized to a 16px grid
const SCALE_FACTOR: f64 = 16.0;

// Per-coordinate row emitted onto the heatmaps topic, keyed by the source
// event's uuid.
#[derive(Debug, Clone, Serialize)]
pub struct HeatmapEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub x: i64,
    pub y: i64,
    pub pointer_target_fixed: bool,
    pub viewport_width: i64,
    pub viewport_height: i64,
    pub current_url: String,
    pub session_id: String,
    pub scale_factor: i64,
    #[serde(serialize_with = "common_kafka::kafka_messages::serialize_datetime")]
    pub timestamp: DateTime<Utc>,
    pub team_id: TeamId,
    pub distinct_id: String,
}

// The shape SDKs send under $heatmap_data: url -> captured interactions
#[derive(Debug, Deserialize)]
struct HeatmapItem {
    x: f64,
    y: f64,
    #[serde(default)]
    target_fixed: bool,
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
}

fn default_kind() -> String {
    "click".to_string()
}

enum Extraction {
    NotPresent,
    Disabled,
    Extracted(Vec<(Uuid, HeatmapEvent)>),
    Invalid,
}

/// The `$$heatmap` fast path: these events exist only to carry heatmap
/// data, so they fan out to the heatmaps topic and produce no enriched
/// record. Runs right after validation, bypassing everything else.
pub fn process_fast_path(
    mut buffer: Vec<StageResult>,
    warnings: &mut Vec<IngestionWarning>,
    sink: &mut Vec<(Uuid, HeatmapEvent)>,
) -> Vec<StageResult> {
    for item in buffer.iter_mut() {
        let Ok(event) = item else {
            continue;
        };
        if event.event != HEATMAP_EVENT {
            continue;
        }

        let uuid = event.uuid;
        match extract(event) {
            Extraction::Extracted(records) => {
                counter!(HEATMAP_EVENTS_EMITTED).increment(records.len() as u64);
                sink.extend(records);
                *item = Err(EventError::EmittedAsHeatmap(uuid));
            }
            Extraction::NotPresent | Extraction::Disabled => {
                *item = Err(EventError::EmittedAsHeatmap(uuid));
            }
            Extraction::Invalid => {
                warnings.push(invalid_warning(event));
                *item = Err(EventError::InvalidHeatmapData(uuid));
            }
        }
    }

    buffer
}

/// Heatmap data riding along on ordinary events. Extraction failures warn
/// and never abort the event, and `$heatmap_data` is always removed from
/// the outgoing properties.
pub fn process_embedded(
    mut buffer: Vec<StageResult>,
    warnings: &mut Vec<IngestionWarning>,
    sink: &mut Vec<(Uuid, HeatmapEvent)>,
) -> Vec<StageResult> {
    for item in buffer.iter_mut() {
        let Ok(event) = item else {
            continue;
        };

        match extract(event) {
            Extraction::Extracted(records) => {
                counter!(HEATMAP_EVENTS_EMITTED).increment(records.len() as u64);
                sink.extend(records);
            }
            Extraction::Invalid => warnings.push(invalid_warning(event)),
            Extraction::NotPresent | Extraction::Disabled => {}
        }
    }

    buffer
}

fn invalid_warning(event: &PreparedEvent) -> IngestionWarning {
    warning(
        event.team.id,
        "invalid_heatmap_data",
        HashMap::from([("eventUuid".to_string(), json!(event.uuid))]),
    )
}

fn extract(event: &mut PreparedEvent) -> Extraction {
    let Some(data) = event.properties.remove("$heatmap_data") else {
        return Extraction::NotPresent;
    };

    // Opt-out still consumes the data, it just doesn't go anywhere
    if event.team.heatmaps_opt_in == Some(false) {
        return Extraction::Disabled;
    }

    let Some(session_id) = event
        .properties
        .get("$session_id")
        .and_then(Value::as_str)
        .map(String::from)
    else {
        return Extraction::Invalid;
    };

    let by_url: HashMap<String, Vec<HeatmapItem>> = match serde_json::from_value(data) {
        Ok(parsed) => parsed,
        Err(_) => return Extraction::Invalid,
    };

    let viewport_width = scale(dimension(&event.properties, "$viewport_width"));
    let viewport_height = scale(dimension(&event.properties, "$viewport_height"));

    let mut records = Vec::new();
    for (url, items) in by_url {
        for item in items {
            records.push((
                event.uuid,
                HeatmapEvent {
                    kind: item.kind,
                    x: scale(item.x),
                    y: scale(item.y),
                    pointer_target_fixed: item.target_fixed,
                    viewport_width,
                    viewport_height,
                    current_url: url.clone(),
                    session_id: session_id.clone(),
                    scale_factor: SCALE_FACTOR as i64,
                    timestamp: event.timestamp,
                    team_id: event.team.id,
                    distinct_id: event.distinct_id.clone(),
                },
            ));
        }
    }

    Extraction::Extracted(records)
}

fn dimension(properties: &HashMap<String, Value>, key: &str) -> f64 {
    properties.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn scale(value: f64) -> i64 {
    (value / SCALE_FACTOR).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::prepared_event;

    fn heatmap_event() -> PreparedEvent {
        let mut event = prepared_event(1, HEATMAP_EVENT, "d1");
        event
            .properties
            .insert("$session_id".to_string(), json!("s1"));
        event
            .properties
            .insert("$viewport_width".to_string(), json!(1024));
        event
            .properties
            .insert("$viewport_height".to_string(), json!(768));
        event.properties.insert(
            "$heatmap_data".to_string(),
            json!({
                "https://example.com/": [
                    {"x": 10, "y": 20, "target_fixed": false, "type": "click"},
                    {"x": 600, "y": 300, "target_fixed": true, "type": "rageclick"},
                ],
                "https://example.com/other": [
                    {"x": 1, "y": 1},
                ]
            }),
        );
        event
    }

    #[test]
    fn fast_path_fans_out_and_produces_no_enriched_event() {
        let event = heatmap_event();
        let uuid = event.uuid;
        let mut warnings = Vec::new();
        let mut sink = Vec::new();

        let out = process_fast_path(vec![Ok(event)], &mut warnings, &mut sink);

        assert_eq!(sink.len(), 3);
        assert!(matches!(out[0], Err(EventError::EmittedAsHeatmap(u)) if u == uuid));
        assert!(warnings.is_empty());

        // Keyed by the source event uuid, coordinates quantized to the grid
        let (key, record) = sink
            .iter()
            .find(|(_, r)| r.current_url == "https://example.com/" && r.kind == "click")
            .unwrap();
        assert_eq!(*key, uuid);
        assert_eq!(record.x, 1); // ceil(10 / 16)
        assert_eq!(record.y, 2); // ceil(20 / 16)
        assert_eq!(record.viewport_width, 64); // ceil(1024 / 16)
        assert_eq!(record.session_id, "s1");
    }

    #[test]
    fn invalid_data_on_fast_path_drops_with_warning() {
        let mut event = heatmap_event();
        event
            .properties
            .insert("$heatmap_data".to_string(), json!([1, 2, 3]));
        let mut warnings = Vec::new();
        let mut sink = Vec::new();

        let out = process_fast_path(vec![Ok(event)], &mut warnings, &mut sink);

        assert!(matches!(out[0], Err(EventError::InvalidHeatmapData(_))));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].warning_type, "invalid_heatmap_data");
        assert!(sink.is_empty());
    }

    #[test]
    fn missing_session_id_is_invalid() {
        let mut event = heatmap_event();
        event.properties.remove("$session_id");
        let mut warnings = Vec::new();
        let mut sink = Vec::new();
        let out = process_fast_path(vec![Ok(event)], &mut warnings, &mut sink);
        assert!(matches!(out[0], Err(EventError::InvalidHeatmapData(_))));
    }

    #[test]
    fn embedded_data_is_extracted_and_stripped_without_dropping() {
        let mut event = heatmap_event();
        event.event = "$pageview".to_string();
        let mut warnings = Vec::new();
        let mut sink = Vec::new();

        let out = process_embedded(vec![Ok(event)], &mut warnings, &mut sink);

        assert_eq!(sink.len(), 3);
        let event = out[0].as_ref().unwrap();
        assert!(!event.properties.contains_key("$heatmap_data"));
    }

    #[test]
    fn embedded_invalid_data_warns_but_keeps_the_event() {
        let mut event = heatmap_event();
        event.event = "$pageview".to_string();
        event
            .properties
            .insert("$heatmap_data".to_string(), json!("not-a-map"));
        let mut warnings = Vec::new();
        let mut sink = Vec::new();

        let out = process_embedded(vec![Ok(event)], &mut warnings, &mut sink);

        assert!(out[0].is_ok());
        assert_eq!(warnings.len(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn opted_out_teams_emit_nothing() {
        let mut event = heatmap_event();
        event.team.heatmaps_opt_in = Some(false);
        let mut warnings = Vec::new();
        let mut sink = Vec::new();

        let out = process_fast_path(vec![Ok(event)], &mut warnings, &mut sink);

        assert!(sink.is_empty());
        assert!(warnings.is_empty());
        // Still no enriched record for $$heatmap
        assert!(matches!(out[0], Err(EventError::EmittedAsHeatmap(_))));
    }
}
