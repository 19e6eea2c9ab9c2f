//! End-to-end pipeline scenarios, driven through handle_batch over the
//! in-memory stores.

use common_types::{PersonMode, RawEvent, Team};
use ingester::error::{EventError, UnhandledError};
use ingester::pipeline::handle_batch;
use ingester::test_utils::{team, test_pipeline, TestPipeline};
use serde_json::{json, Value};
use uuid::Uuid;

const TOKEN: &str = "token1";

fn pipeline() -> TestPipeline {
    test_pipeline(vec![team(1, TOKEN)])
}

fn raw(value: Value) -> RawEvent {
    serde_json::from_value(value).unwrap()
}

fn event(name: &str, distinct_id: &str, properties: Value) -> RawEvent {
    raw(json!({
        "token": TOKEN,
        "uuid": Uuid::now_v7().to_string(),
        "event": name,
        "distinct_id": distinct_id,
        "properties": properties,
    }))
}

fn identify(distinct_id: &str, anon_distinct_id: &str, set: Value) -> RawEvent {
    event(
        "$identify",
        distinct_id,
        json!({"$anon_distinct_id": anon_distinct_id, "$set": set}),
    )
}

async fn run(pipeline: &TestPipeline, events: Vec<RawEvent>) -> ingester::pipeline::PipelineOutput {
    handle_batch(events, &pipeline.context)
        .await
        .expect("batch succeeds")
}

fn person_properties(enriched: &common_types::ClickHouseEvent) -> Value {
    serde_json::from_str(enriched.person_properties.as_ref().unwrap()).unwrap()
}

#[tokio::test]
async fn anonymous_pageview_creates_a_person() {
    let p = pipeline();
    let input = event("$pageview", "d1", json!({}));
    let input_uuid = input.uuid.clone().unwrap();

    let output = run(&p, vec![input]).await;

    let enriched = output.results[0].as_ref().unwrap();
    assert_eq!(enriched.uuid.to_string(), input_uuid);
    assert_eq!(enriched.distinct_id, "d1");
    assert_eq!(enriched.person_mode, PersonMode::Full);

    let person = p.person_repo.person_for(1, "d1").expect("person created");
    assert!(!person.is_identified);
    assert_eq!(enriched.person_id.as_deref(), Some(person.uuid.to_string().as_str()));

    // The creation was announced downstream
    assert_eq!(output.side_effects.person_updates.len(), 1);
    assert!(!output.side_effects.person_updates[0].is_deleted);
}

#[tokio::test]
async fn identify_links_both_distinct_ids_to_one_person() {
    let p = pipeline();
    run(&p, vec![event("$pageview", "d1", json!({}))]).await;

    let output = run(&p, vec![identify("user@x", "d1", json!({"plan": "pro"}))]).await;

    let enriched = output.results[0].as_ref().unwrap();
    let by_anon = p.person_repo.person_for(1, "d1").unwrap();
    let by_known = p.person_repo.person_for(1, "user@x").unwrap();
    assert_eq!(by_anon.id, by_known.id);
    assert!(by_known.is_identified);
    assert_eq!(by_known.properties["plan"], json!("pro"));

    // The enriched output reflects the post-$set snapshot
    assert_eq!(person_properties(enriched)["plan"], json!("pro"));
    assert_eq!(p.person_repo.person_count(), 1);
    p.person_repo.assert_mappings_consistent();
}

#[tokio::test]
async fn cross_person_merge_deletes_the_loser() {
    let p = pipeline();
    run(
        &p,
        vec![
            event("$pageview", "d1", json!({"$set": {"a": 1}})),
            event("$pageview", "d2", json!({"$set": {"b": 2}})),
        ],
    )
    .await;
    assert_eq!(p.person_repo.person_count(), 2);

    let output = run(&p, vec![identify("d2", "d1", json!({}))]).await;

    assert_eq!(p.person_repo.person_count(), 1);
    let survivor = p.person_repo.person_for(1, "d1").unwrap();
    assert_eq!(survivor.id, p.person_repo.person_for(1, "d2").unwrap().id);
    assert!(survivor.is_identified);
    // Property union survives the merge
    assert_eq!(survivor.properties["a"], json!(1));
    assert_eq!(survivor.properties["b"], json!(2));
    p.person_repo.assert_mappings_consistent();

    // Survivor upsert plus loser tombstone went downstream
    let updates = &output.side_effects.person_updates;
    assert!(updates.iter().any(|u| u.is_deleted));
    assert!(updates.iter().any(|u| !u.is_deleted));
}

#[tokio::test]
async fn merge_chains_converge_regardless_of_order() {
    // A<->B then B<->C, against C<->B then B<->A
    let p1 = pipeline();
    run(
        &p1,
        vec![
            event("$pageview", "a", json!({})),
            event("$pageview", "b", json!({})),
            event("$pageview", "c", json!({})),
            identify("b", "a", json!({})),
            identify("c", "b", json!({})),
        ],
    )
    .await;

    let p2 = pipeline();
    run(
        &p2,
        vec![
            event("$pageview", "a", json!({})),
            event("$pageview", "b", json!({})),
            event("$pageview", "c", json!({})),
            identify("b", "c", json!({})),
            identify("a", "b", json!({})),
        ],
    )
    .await;

    for p in [&p1, &p2] {
        assert_eq!(p.person_repo.person_count(), 1);
        let pa = p.person_repo.person_for(1, "a").unwrap();
        let pb = p.person_repo.person_for(1, "b").unwrap();
        let pc = p.person_repo.person_for(1, "c").unwrap();
        assert_eq!(pa.id, pb.id);
        assert_eq!(pb.id, pc.id);
        p.person_repo.assert_mappings_consistent();
    }
}

#[tokio::test]
async fn replaying_an_event_is_idempotent() {
    let p = pipeline();
    let replayed = identify("user@x", "d1", json!({"plan": "pro"}));

    run(&p, vec![replayed.clone()]).await;
    let after_first = p.person_repo.person_for(1, "user@x").unwrap();

    run(&p, vec![replayed.clone(), replayed]).await;
    let after_replays = p.person_repo.person_for(1, "user@x").unwrap();

    assert_eq!(p.person_repo.person_count(), 1);
    assert_eq!(after_first.properties, after_replays.properties);
    assert_eq!(after_first.is_identified, after_replays.is_identified);
    // Replays didn't bump the version either
    assert_eq!(after_first.version, after_replays.version);
}

#[tokio::test]
async fn set_once_and_unset_precedence_flows_to_the_snapshot() {
    let p = pipeline();
    run(
        &p,
        vec![event(
            "$pageview",
            "d1",
            json!({"$set": {"plan": "free", "stale": 1}, "$set_once": {"first_seen": "jan"}}),
        )],
    )
    .await;

    let output = run(
        &p,
        vec![event(
            "$pageview",
            "d1",
            json!({
                "$set": {"plan": "pro"},
                "$set_once": {"first_seen": "feb"},
                "$unset": ["stale"]
            }),
        )],
    )
    .await;

    let snapshot = person_properties(output.results[0].as_ref().unwrap());
    assert_eq!(snapshot["plan"], json!("pro"));
    assert_eq!(snapshot["first_seen"], json!("jan"));
    assert!(snapshot.get("stale").is_none());
}

#[tokio::test]
async fn merge_dangerously_merges_unconditionally() {
    let p = pipeline();
    run(
        &p,
        vec![
            identify("u1", "a1", json!({})),
            identify("u2", "a2", json!({})),
        ],
    )
    .await;
    assert_eq!(p.person_repo.person_count(), 2);

    run(
        &p,
        vec![event(
            "$merge_dangerously",
            "u1",
            json!({"alias": "u2"}),
        )],
    )
    .await;

    assert_eq!(p.person_repo.person_count(), 1);
    p.person_repo.assert_mappings_consistent();
}

#[tokio::test]
async fn group_types_cap_at_five() {
    let p = pipeline();
    let names = ["org", "company", "project", "instance", "workspace", "extra"];
    let events: Vec<_> = names
        .iter()
        .map(|name| {
            event(
                "$groupidentify",
                "d1",
                json!({"$group_type": name, "$group_key": format!("{name}-1"), "$group_set": {"n": 1}}),
            )
        })
        .collect();

    let output = run(&p, events).await;

    // The first five got indices and wrote group rows
    assert_eq!(output.side_effects.group_updates.len(), 5);
    for (i, result) in output.results.iter().take(5).enumerate() {
        let enriched = result.as_ref().unwrap();
        let props: Value = serde_json::from_str(enriched.properties.as_ref().unwrap()).unwrap();
        assert_eq!(props[format!("$group_{i}")], json!(format!("{}-1", names[i])));
    }

    // The sixth type resolves to no index: no group row, no $group_<i> key
    let sixth: Value =
        serde_json::from_str(output.results[5].as_ref().unwrap().properties.as_ref().unwrap())
            .unwrap();
    assert!(!sixth.as_object().unwrap().keys().any(|k| {
        k.strip_prefix("$group_")
            .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
    }));
}

#[tokio::test]
async fn groups_property_maps_to_indexed_keys() {
    let p = pipeline();
    run(
        &p,
        vec![event(
            "$groupidentify",
            "d1",
            json!({"$group_type": "organization", "$group_key": "org-1"}),
        )],
    )
    .await;

    let output = run(
        &p,
        vec![event(
            "$pageview",
            "d1",
            json!({"$groups": {"organization": "org-1", "unknown-type": "x"}}),
        )],
    )
    .await;

    let props: Value =
        serde_json::from_str(output.results[0].as_ref().unwrap().properties.as_ref().unwrap())
            .unwrap();
    assert_eq!(props["$group_0"], json!("org-1"));
    // Under the cap, first encounter in $groups registers the type
    assert_eq!(props["$group_1"], json!("x"));
}

#[tokio::test]
async fn groupidentify_updates_group_properties() {
    let p = pipeline();
    run(
        &p,
        vec![
            event(
                "$groupidentify",
                "d1",
                json!({"$group_type": "organization", "$group_key": "org-1", "$group_set": {"plan": "free", "seats": 1}, "$group_set_once": {"created_by": "alice"}}),
            ),
            event(
                "$groupidentify",
                "d1",
                json!({"$group_type": "organization", "$group_key": "org-1", "$group_set": {"plan": "pro"}, "$group_set_once": {"created_by": "bob"}}),
            ),
        ],
    )
    .await;

    let props = p.group_repo.group_properties(1, 0, "org-1").unwrap();
    assert_eq!(props["plan"], json!("pro"));
    assert_eq!(props["seats"], json!(1));
    // set_once kept the original value
    assert_eq!(props["created_by"], json!("alice"));
}

#[tokio::test]
async fn personless_events_skip_person_and_group_processing() {
    let p = pipeline();
    let output = run(
        &p,
        vec![event(
            "$pageview",
            "d1",
            json!({"$process_person_profile": false, "$groups": {"organization": "org-1"}}),
        )],
    )
    .await;

    let enriched = output.results[0].as_ref().unwrap();
    assert_eq!(enriched.person_mode, PersonMode::Propertyless);
    assert_eq!(enriched.person_properties.as_deref(), Some("{}"));
    let props: Value = serde_json::from_str(enriched.properties.as_ref().unwrap()).unwrap();
    assert!(props.get("$groups").is_none());
    assert!(props.get("$group_0").is_none());

    // No person was created, no group row written
    assert_eq!(p.person_repo.person_count(), 0);
    assert!(output.side_effects.group_updates.is_empty());
}

#[tokio::test]
async fn person_opt_out_team_drops_identify() {
    let p = test_pipeline(vec![Team {
        person_processing_opt_out: Some(true),
        ..team(1, TOKEN)
    }]);

    let output = run(&p, vec![identify("user@x", "d1", json!({}))]).await;

    let err = output.results[0].as_ref().unwrap_err();
    assert!(matches!(err, EventError::RestrictedWhenPersonless { .. }));
    assert!(err.do_not_send_to_dlq());
    assert_eq!(p.person_repo.person_count(), 0);
}

#[tokio::test]
async fn heatmap_fast_path_emits_no_enriched_event() {
    let p = pipeline();
    let output = run(
        &p,
        vec![event(
            "$$heatmap",
            "d1",
            json!({
                "$session_id": "s1",
                "$viewport_width": 1024,
                "$viewport_height": 768,
                "$heatmap_data": {"https://example.com/": [
                    {"x": 10, "y": 20, "target_fixed": false, "type": "click"},
                    {"x": 30, "y": 40, "target_fixed": true, "type": "click"},
                ]}
            }),
        )],
    )
    .await;

    assert!(matches!(
        output.results[0],
        Err(EventError::EmittedAsHeatmap(_))
    ));
    assert_eq!(output.side_effects.heatmaps.len(), 2);
    // No person processing happened on the fast path
    assert_eq!(p.person_repo.person_count(), 0);
}

#[tokio::test]
async fn force_upgraded_persons_suppress_property_writes() {
    let p = pipeline();
    run(&p, vec![event("$pageview", "d1", json!({"$set": {"a": 1}}))]).await;
    p.person_repo.set_force_upgrade(1, "d1");

    let output = run(&p, vec![event("$pageview", "d1", json!({"$set": {"a": 2}}))]).await;

    let enriched = output.results[0].as_ref().unwrap();
    assert_eq!(enriched.person_mode, PersonMode::ForceUpgrade);
    // The write was suppressed, the snapshot still reflects stored state
    let person = p.person_repo.person_for(1, "d1").unwrap();
    assert_eq!(person.properties["a"], json!(1));
    assert_eq!(person_properties(enriched)["a"], json!(1));
}

#[tokio::test]
async fn exhausted_update_retries_surface_as_a_pipeline_failure() {
    let p = pipeline();
    run(&p, vec![event("$pageview", "d1", json!({}))]).await;
    p.person_repo.inject_update_conflicts(100);

    let failure = handle_batch(
        vec![event("$pageview", "d1", json!({"$set": {"a": 1}}))],
        &p.context,
    )
    .await
    .expect_err("conflicts exhaust the retry loop");

    assert_eq!(failure.index, 0);
    assert!(matches!(
        failure.error,
        UnhandledError::PersonUpdateConflict { .. }
    ));
}

#[tokio::test]
async fn batches_keep_slot_alignment_across_mixed_outcomes() {
    let p = pipeline();
    let output = run(
        &p,
        vec![
            event("$pageview", "d1", json!({})),
            raw(json!({"token": "unknown", "uuid": Uuid::now_v7().to_string(), "event": "e", "distinct_id": "d"})),
            raw(json!({"token": TOKEN, "uuid": "not-a-uuid", "event": "e", "distinct_id": "d"})),
            event("$pageview", "d2", json!({})),
        ],
    )
    .await;

    assert_eq!(output.results.len(), 4);
    assert!(output.results[0].is_ok());
    assert!(matches!(output.results[1], Err(EventError::InvalidToken)));
    assert!(matches!(output.results[2], Err(EventError::InvalidUuid { .. })));
    assert!(output.results[3].is_ok());
}
