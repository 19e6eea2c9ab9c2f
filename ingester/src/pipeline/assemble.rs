use chrono::Utc;
use common_types::{format::format_ch_datetime, ClickHouseEvent, PersonMode, TeamId};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::{
    elements::elements_to_chain,
    error::{PipelineResult, StageResult},
    pipeline::PreparedEvent,
};

/// Build the enriched output record: IP anonymization, elements chain
/// rendering, the person snapshot, and stringification into the shape the
/// events topic expects.
pub fn assemble_events(buffer: Vec<StageResult>) -> Vec<PipelineResult> {
    buffer
        .into_iter()
        .map(|item| item.map(assemble_one))
        .collect()
}

/// Personless events still need a stable person id downstream, derived
/// deterministically so replays and late upgrades agree on it.
pub fn personless_uuid(team_id: TeamId, distinct_id: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{team_id}:{distinct_id}").as_bytes(),
    )
}

fn assemble_one(mut event: PreparedEvent) -> ClickHouseEvent {
    if event.team.anonymize_ips {
        event.properties.remove("$ip");
    }

    let elements_chain = match event.properties.remove("$elements") {
        Some(Value::Array(elements)) => {
            let chain = elements_to_chain(&elements);
            if chain.is_none() {
                // Bad autocapture payloads lose their elements, not the event
                warn!(event_uuid = %event.uuid, "failed to render elements chain");
            }
            chain
        }
        Some(_) | None => None,
    };

    let (person_id, person_properties, person_created_at) = match event.person_mode {
        PersonMode::Full | PersonMode::ForceUpgrade => match &event.person {
            Some(person) => (
                Some(person.uuid.to_string()),
                Some(
                    serde_json::to_string(&person.properties)
                        .expect("person properties are serializable"),
                ),
                Some(format_ch_datetime(person.created_at)),
            ),
            None => (None, Some("{}".to_string()), None),
        },
        PersonMode::Propertyless => (
            Some(personless_uuid(event.team.id, &event.distinct_id).to_string()),
            Some("{}".to_string()),
            None,
        ),
    };

    ClickHouseEvent {
        uuid: event.uuid,
        team_id: event.team.id,
        project_id: event.team.project_id(),
        event: event.event,
        distinct_id: event.distinct_id,
        properties: Some(
            serde_json::to_string(&event.properties)
                .expect("event properties were deserialized from json"),
        ),
        person_id,
        timestamp: format_ch_datetime(event.timestamp),
        created_at: format_ch_datetime(Utc::now()),
        elements_chain,
        person_created_at,
        person_properties,
        person_mode: event.person_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{person, prepared_event};
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn round_trips_uuid_and_distinct_id() {
        let event = prepared_event(1, "$pageview", "d1");
        let uuid = event.uuid;
        let out = assemble_events(vec![Ok(event)]);
        let enriched = out[0].as_ref().unwrap();

        let serialized = serde_json::to_string(enriched).unwrap();
        let parsed: ClickHouseEvent = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed.uuid, uuid);
        assert_eq!(parsed.distinct_id, "d1");
    }

    #[test]
    fn anonymize_ips_strips_ip() {
        let mut event = prepared_event(1, "$pageview", "d1");
        event.team.anonymize_ips = true;
        event.properties.insert("$ip".to_string(), json!("1.2.3.4"));
        let out = assemble_events(vec![Ok(event)]);
        let properties: HashMap<String, Value> =
            serde_json::from_str(out[0].as_ref().unwrap().properties.as_ref().unwrap()).unwrap();
        assert!(!properties.contains_key("$ip"));
    }

    #[test]
    fn ip_is_kept_without_opt_in() {
        let mut event = prepared_event(1, "$pageview", "d1");
        event.properties.insert("$ip".to_string(), json!("1.2.3.4"));
        let out = assemble_events(vec![Ok(event)]);
        let properties: HashMap<String, Value> =
            serde_json::from_str(out[0].as_ref().unwrap().properties.as_ref().unwrap()).unwrap();
        assert_eq!(properties["$ip"], json!("1.2.3.4"));
    }

    #[test]
    fn elements_render_into_the_chain() {
        let mut event = prepared_event(1, "$autocapture", "d1");
        event.properties.insert(
            "$elements".to_string(),
            json!([{"tag_name": "button", "$el_text": "Buy"}]),
        );
        let out = assemble_events(vec![Ok(event)]);
        let enriched = out[0].as_ref().unwrap();
        assert_eq!(
            enriched.elements_chain.as_deref(),
            Some(r#"button:text="Buy""#)
        );
        let properties: HashMap<String, Value> =
            serde_json::from_str(enriched.properties.as_ref().unwrap()).unwrap();
        assert!(!properties.contains_key("$elements"));
    }

    #[test]
    fn full_mode_snapshots_the_attached_person() {
        let mut event = prepared_event(1, "$pageview", "d1");
        let person = person(1, json!({"plan": "pro"}));
        let person_uuid = person.uuid;
        event.person = Some(person);

        let out = assemble_events(vec![Ok(event)]);
        let enriched = out[0].as_ref().unwrap();
        assert_eq!(enriched.person_id.as_deref(), Some(person_uuid.to_string().as_str()));
        let snapshot: Value =
            serde_json::from_str(enriched.person_properties.as_ref().unwrap()).unwrap();
        assert_eq!(snapshot["plan"], json!("pro"));
        assert!(enriched.person_created_at.is_some());
    }

    #[test]
    fn propertyless_mode_gets_deterministic_person_id_and_empty_properties() {
        let mut event = prepared_event(1, "$pageview", "d1");
        event.person_mode = PersonMode::Propertyless;
        let out = assemble_events(vec![Ok(event)]);
        let enriched = out[0].as_ref().unwrap();

        assert_eq!(enriched.person_mode, PersonMode::Propertyless);
        assert_eq!(enriched.person_properties.as_deref(), Some("{}"));
        assert_eq!(
            enriched.person_id.as_deref(),
            Some(personless_uuid(1, "d1").to_string().as_str())
        );
        assert!(enriched.person_created_at.is_none());
    }
}
