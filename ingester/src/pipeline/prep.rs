use std::collections::HashMap;

use chrono::Utc;
use common_kafka::kafka_messages::ingest_warning::IngestionWarning;
use common_types::{
    timestamp::{parse_date, parse_event_timestamp, TimestampWarning},
    PersonMode, RawEvent, Team,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    config::SkipTokens,
    error::{EventError, StageResult},
    pipeline::PreparedEvent,
    recursively_sanitize_properties, sanitize_string,
    teams::TeamRef,
};

pub const INGESTION_WARNING_SOURCE: &str = "plugin-server";

// Events on this sentinel get hashed into real distinct ids by a separate
// pipeline - if one reaches us, something upstream is misconfigured
pub const COOKIELESS_SENTINEL: &str = "$posthog_cookieless";

const MAX_EVENT_NAME_LENGTH: usize = 200;

// Identity and group mutations make no sense without person processing
const PERSONLESS_RESTRICTED_EVENTS: &[&str] = &[
    "$identify",
    "$create_alias",
    "$merge_dangerously",
    "$groupidentify",
];

#[derive(Debug, Clone, Default)]
pub struct PrepSettings {
    pub timestamp_future_tolerance_ms: i64,
    pub skip_tokens: SkipTokens,
}

/// Validation and normalization. Takes the raw decoded events plus the team
/// lookup table, and produces one slot per input: a PreparedEvent ready for
/// downstream stages, or a typed drop.
pub fn prepare_events(
    events: Vec<RawEvent>,
    teams_lut: &HashMap<TeamRef, Option<Team>>,
    settings: &PrepSettings,
    warnings: &mut Vec<IngestionWarning>,
) -> Vec<StageResult> {
    events
        .into_iter()
        .map(|event| prepare_one(event, teams_lut, settings, warnings))
        .collect()
}

fn prepare_one(
    mut raw: RawEvent,
    teams_lut: &HashMap<TeamRef, Option<Team>>,
    settings: &PrepSettings,
    warnings: &mut Vec<IngestionWarning>,
) -> StageResult {
    let refs = TeamRef::refs_for_event(&raw);
    let team = refs
        .iter()
        .filter_map(|r| {
            teams_lut
                .get(r)
                .expect("Team lookup table is fully populated")
                .as_ref()
        })
        .next()
        .cloned();
    let Some(team) = team else {
        return Err(EventError::InvalidToken);
    };

    let raw_uuid = raw
        .uuid
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let Ok(uuid) = Uuid::parse_str(&raw_uuid) else {
        return invalid_uuid(team.id, raw_uuid, raw, warnings);
    };

    let Some(distinct_id) = raw.extract_distinct_id() else {
        return Err(EventError::malformed(
            "missing distinct_id",
            Some(Box::new(raw)),
        ));
    };
    let distinct_id = sanitize_string(distinct_id);

    if distinct_id == COOKIELESS_SENTINEL {
        return Err(EventError::CookielessFiltered(uuid));
    }

    let event_name = sanitize_event_name(&raw.event);
    if event_name.is_empty() {
        return Err(EventError::malformed("empty event name", Some(Box::new(raw))));
    }

    // Grab the token before properties get taken below, it can live in either place
    let token = raw.extract_token();

    let mut sanitize_failure = None;
    for value in raw.properties.values_mut() {
        if let Err(e) = recursively_sanitize_properties(uuid, value, 0) {
            sanitize_failure = Some(e.to_string());
            break;
        }
    }
    if let Some(reason) = sanitize_failure {
        return Err(EventError::malformed(reason, Some(Box::new(raw))));
    }

    let mut properties = std::mem::take(&mut raw.properties);

    // Fold the root-level $set / $set_once into properties, the root fields
    // winning over any property-level duplicates
    if let Some(set) = raw.set.take() {
        fold_into_property_object(&mut properties, "$set", set);
    }
    if let Some(set_once) = raw.set_once.take() {
        fold_into_property_object(&mut properties, "$set_once", set_once);
    }

    let sent_at = raw.sent_at.as_deref().and_then(parse_date);
    let ignore_sent_at = properties
        .get("$ignore_sent_at")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let (timestamp, ts_warning) = parse_event_timestamp(
        raw.timestamp.as_deref(),
        raw.extract_offset(),
        sent_at,
        ignore_sent_at,
        settings.timestamp_future_tolerance_ms,
        Utc::now(),
    );

    match ts_warning {
        Some(TimestampWarning::FutureEvent { parsed }) => {
            warnings.push(warning(
                team.id,
                "event_timestamp_in_future",
                HashMap::from([
                    ("eventUuid".to_string(), json!(uuid)),
                    ("timestamp".to_string(), json!(raw.timestamp)),
                    ("parsed".to_string(), json!(parsed.to_rfc3339())),
                ]),
            ));
        }
        Some(TimestampWarning::Invalid { raw: raw_ts }) => {
            warnings.push(warning(
                team.id,
                "ignored_invalid_timestamp",
                HashMap::from([
                    ("eventUuid".to_string(), json!(uuid)),
                    ("field".to_string(), json!("timestamp")),
                    ("value".to_string(), json!(raw_ts)),
                ]),
            ));
        }
        None => {}
    }

    let person_processing = resolve_person_processing(
        &team,
        token.as_deref(),
        &distinct_id,
        &properties,
        settings,
        uuid,
        warnings,
    );

    if !person_processing {
        if PERSONLESS_RESTRICTED_EVENTS.contains(&event_name.as_str()) {
            return Err(EventError::RestrictedWhenPersonless {
                uuid,
                event: event_name,
            });
        }
        strip_person_properties(&mut properties);
    }

    Ok(PreparedEvent {
        uuid,
        team,
        event: event_name,
        distinct_id,
        timestamp,
        properties,
        person_mode: if person_processing {
            PersonMode::Full
        } else {
            PersonMode::Propertyless
        },
        person: None,
    })
}

fn invalid_uuid(
    team_id: i32,
    raw_uuid: String,
    raw: RawEvent,
    warnings: &mut Vec<IngestionWarning>,
) -> StageResult {
    warnings.push(warning(
        team_id,
        "invalid_event_uuid",
        HashMap::from([("uuid".to_string(), json!(raw_uuid.clone()))]),
    ));
    Err(EventError::InvalidUuid {
        team_id,
        raw: raw_uuid,
        event: Box::new(raw),
    })
}

pub fn warning(
    team_id: i32,
    warning_type: &str,
    details: HashMap<String, Value>,
) -> IngestionWarning {
    IngestionWarning::new(
        team_id,
        INGESTION_WARNING_SOURCE.to_string(),
        warning_type.to_string(),
        details,
        None,
    )
}

// Trimmed, control characters stripped, length capped
fn sanitize_event_name(name: &str) -> String {
    sanitize_string(
        name.trim()
            .chars()
            .filter(|c| !c.is_control())
            .take(MAX_EVENT_NAME_LENGTH)
            .collect(),
    )
}

fn fold_into_property_object(
    properties: &mut HashMap<String, Value>,
    key: &str,
    root: HashMap<String, Value>,
) {
    let mut merged = match properties.get(key) {
        Some(Value::Object(existing)) => existing.clone(),
        _ => serde_json::Map::new(),
    };
    for (k, v) in root {
        merged.insert(k, v);
    }
    properties.insert(key.to_string(), Value::Object(merged));
}

// Team opt-out wins over everything, then the skip-token config, then the
// event's own $process_person_profile
fn resolve_person_processing(
    team: &Team,
    token: Option<&str>,
    distinct_id: &str,
    properties: &HashMap<String, Value>,
    settings: &PrepSettings,
    uuid: Uuid,
    warnings: &mut Vec<IngestionWarning>,
) -> bool {
    if team.person_processing_opt_out == Some(true) {
        return false;
    }

    if let Some(token) = token {
        if settings.skip_tokens.matches(token, distinct_id) {
            return false;
        }
    }

    match properties.get("$process_person_profile") {
        Some(Value::Bool(enabled)) => *enabled,
        None => true,
        Some(other) => {
            warnings.push(warning(
                team.id,
                "invalid_process_person_profile",
                HashMap::from([
                    ("eventUuid".to_string(), json!(uuid)),
                    ("value".to_string(), other.clone()),
                ]),
            ));
            true
        }
    }
}

fn strip_person_properties(properties: &mut HashMap<String, Value>) {
    properties.remove("$set");
    properties.remove("$set_once");
    properties.remove("$unset");
    properties.remove("$groups");
    properties.retain(|key, _| !key.starts_with("$group_"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn team() -> Team {
        Team {
            id: 1,
            project_id: Some(1),
            api_token: "token1".to_string(),
            ..Default::default()
        }
    }

    fn lut() -> HashMap<TeamRef, Option<Team>> {
        HashMap::from([(TeamRef::Token("token1".to_string()), Some(team()))])
    }

    fn raw(value: serde_json::Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    fn settings() -> PrepSettings {
        PrepSettings {
            timestamp_future_tolerance_ms: 23 * 3600 * 1000,
            skip_tokens: SkipTokens::default(),
        }
    }

    fn prepare(event: RawEvent) -> (StageResult, Vec<IngestionWarning>) {
        let mut warnings = Vec::new();
        let result = prepare_one(event, &lut(), &settings(), &mut warnings);
        (result, warnings)
    }

    const UUID: &str = "0194ad75-6a16-7f42-925d-a6303b0e06ce";

    fn pageview() -> RawEvent {
        raw(json!({
            "token": "token1",
            "uuid": UUID,
            "event": "$pageview",
            "distinct_id": "d1",
            "properties": {}
        }))
    }

    #[test]
    fn resolves_team_by_token() {
        let (result, warnings) = prepare(pageview());
        let prepared = result.unwrap();
        assert_eq!(prepared.team.id, 1);
        assert_eq!(prepared.person_mode, PersonMode::Full);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unknown_token_is_dropped() {
        let mut event = pageview();
        event.token = Some("who-dis".to_string());
        let mut warnings = Vec::new();
        let mut lut = lut();
        lut.insert(TeamRef::Token("who-dis".to_string()), None);
        let result = prepare_one(event, &lut, &settings(), &mut warnings);
        assert!(matches!(result, Err(EventError::InvalidToken)));
    }

    #[test]
    fn missing_token_and_team_id_is_dropped() {
        let event = raw(json!({"uuid": UUID, "event": "e", "distinct_id": "d1"}));
        let (result, _) = prepare(event);
        assert!(matches!(result, Err(EventError::InvalidToken)));
    }

    #[test]
    fn null_byte_token_fails_lookup_without_crashing() {
        let mut event = pageview();
        event.token = Some("tok\u{0000}en1".to_string());
        let mut warnings = Vec::new();
        let mut lut = lut();
        // The sanitized form is what gets looked up, and doesn't match
        lut.insert(TeamRef::Token("tok\u{FFFD}en1".to_string()), None);
        let result = prepare_one(event, &lut, &settings(), &mut warnings);
        assert!(matches!(result, Err(EventError::InvalidToken)));
    }

    #[test]
    fn team_id_fallback_resolves() {
        let event = raw(json!({"team_id": 1, "uuid": UUID, "event": "e", "distinct_id": "d1"}));
        let mut lut = lut();
        lut.insert(TeamRef::Id(1), Some(team()));
        let mut warnings = Vec::new();
        let result = prepare_one(event, &lut, &settings(), &mut warnings);
        assert!(result.is_ok());
    }

    #[test]
    fn invalid_uuid_is_dropped_with_warning() {
        let mut event = pageview();
        event.uuid = Some("not-a-uuid".to_string());
        let (result, warnings) = prepare(event);
        assert!(matches!(result, Err(EventError::InvalidUuid { .. })));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].warning_type, "invalid_event_uuid");
    }

    #[test]
    fn missing_uuid_is_dropped() {
        let mut event = pageview();
        event.uuid = None;
        let (result, _) = prepare(event);
        assert!(matches!(result, Err(EventError::InvalidUuid { .. })));
    }

    #[test]
    fn missing_distinct_id_is_malformed() {
        let mut event = pageview();
        event.distinct_id = None;
        let (result, _) = prepare(event);
        let err = result.unwrap_err();
        assert_eq!(err.drop_cause(), "malformed");
        // Malformed events carry their payload so the consumer can DLQ them
        assert!(err.dlq_payload().is_some());
    }

    #[test]
    fn cookieless_sentinel_is_filtered() {
        let mut event = pageview();
        event.distinct_id = Some(json!(COOKIELESS_SENTINEL));
        let (result, _) = prepare(event);
        assert!(matches!(result, Err(EventError::CookielessFiltered(_))));
    }

    #[test]
    fn event_names_are_normalized() {
        let mut event = pageview();
        event.event = "  my\u{0007}event  ".to_string();
        let (result, _) = prepare(event);
        assert_eq!(result.unwrap().event, "myevent");

        let mut event = pageview();
        event.event = "x".repeat(300);
        let (result, _) = prepare(event);
        assert_eq!(result.unwrap().event.len(), 200);
    }

    #[test]
    fn root_set_folds_into_properties() {
        let event = raw(json!({
            "token": "token1",
            "uuid": UUID,
            "event": "e",
            "distinct_id": "d1",
            "properties": {"$set": {"a": 1, "b": 1}},
            "$set": {"b": 2}
        }));
        let (result, _) = prepare(event);
        let prepared = result.unwrap();
        assert_eq!(prepared.properties["$set"], json!({"a": 1, "b": 2}));
    }

    #[test]
    fn invalid_timestamp_warns_and_uses_now() {
        let mut event = pageview();
        event.timestamp = Some("garbage".to_string());
        let before = Utc::now();
        let (result, warnings) = prepare(event);
        let prepared = result.unwrap();
        assert!(prepared.timestamp >= before);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].warning_type, "ignored_invalid_timestamp");
    }

    #[test]
    fn future_timestamp_is_clamped_with_warning() {
        let mut event = pageview();
        event.timestamp = Some("2999-01-01T00:00:00Z".to_string());
        let (result, warnings) = prepare(event);
        let prepared = result.unwrap();
        assert!(prepared.timestamp <= Utc::now());
        assert_eq!(warnings[0].warning_type, "event_timestamp_in_future");
    }

    #[test]
    fn team_opt_out_beats_event_opt_in() {
        let mut team = team();
        team.person_processing_opt_out = Some(true);
        let lut = HashMap::from([(TeamRef::Token("token1".to_string()), Some(team))]);

        let mut event = pageview();
        event
            .properties
            .insert("$process_person_profile".to_string(), json!(true));
        let mut warnings = Vec::new();
        let result = prepare_one(event, &lut, &settings(), &mut warnings);
        assert_eq!(result.unwrap().person_mode, PersonMode::Propertyless);
    }

    #[test]
    fn personless_identify_is_dropped_and_kept_out_of_the_dlq() {
        let mut event = pageview();
        event.event = "$identify".to_string();
        event
            .properties
            .insert("$process_person_profile".to_string(), json!(false));
        let (result, _) = prepare(event);
        let err = result.unwrap_err();
        assert_eq!(
            err.drop_cause(),
            "invalid_event_when_process_person_profile_is_false"
        );
        assert!(err.do_not_send_to_dlq());
    }

    #[test]
    fn personless_events_are_stripped_of_person_keys() {
        let event = raw(json!({
            "token": "token1",
            "uuid": UUID,
            "event": "e",
            "distinct_id": "d1",
            "properties": {
                "$process_person_profile": false,
                "$set": {"a": 1},
                "$set_once": {"b": 2},
                "$unset": ["c"],
                "$groups": {"organization": "org1"},
                "$group_0": "org1",
                "kept": true
            }
        }));
        let (result, _) = prepare(event);
        let prepared = result.unwrap();
        assert_eq!(prepared.person_mode, PersonMode::Propertyless);
        assert!(!prepared.properties.contains_key("$set"));
        assert!(!prepared.properties.contains_key("$set_once"));
        assert!(!prepared.properties.contains_key("$unset"));
        assert!(!prepared.properties.contains_key("$groups"));
        assert!(!prepared.properties.contains_key("$group_0"));
        assert!(prepared.properties.contains_key("kept"));
    }

    #[test]
    fn non_bool_process_person_profile_warns_and_processes() {
        let mut event = pageview();
        event
            .properties
            .insert("$process_person_profile".to_string(), json!("nope"));
        let (result, warnings) = prepare(event);
        assert_eq!(result.unwrap().person_mode, PersonMode::Full);
        assert_eq!(warnings[0].warning_type, "invalid_process_person_profile");
    }

    #[test]
    fn skip_tokens_disable_person_processing() {
        let mut settings = settings();
        settings.skip_tokens = SkipTokens::parse("token1:d1");
        let mut warnings = Vec::new();
        let result = prepare_one(pageview(), &lut(), &settings, &mut warnings);
        assert_eq!(result.unwrap().person_mode, PersonMode::Propertyless);
    }
}
