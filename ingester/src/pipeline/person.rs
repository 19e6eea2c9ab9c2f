use common_types::PersonMode;
use metrics::counter;
use serde_json::{Map, Value};

use crate::{
    error::{PipelineFailure, StageResult, UnhandledError},
    metric_consts::{PERSONS_CREATED, PERSON_MERGES, PERSON_UPDATE_RETRIES},
    persons::{apply_property_ops, PersonRepo, PersonUpdate, PropertyOps},
    pipeline::PreparedEvent,
};

/// Resolve and mutate the person behind each event: ensure the distinct id
/// maps to a person, handle $identify / $create_alias / $merge_dangerously,
/// apply property writes, and attach the post-event snapshot.
///
/// Events are driven in batch order, so two events for the same distinct id
/// in one batch observe each other's writes, and replays land on the same
/// final state.
pub async fn process_people(
    mut buffer: Vec<StageResult>,
    repo: &dyn PersonRepo,
    retry_max: u32,
    updates: &mut Vec<PersonUpdate>,
) -> Result<Vec<StageResult>, PipelineFailure> {
    for (index, item) in buffer.iter_mut().enumerate() {
        let Ok(event) = item else {
            continue;
        };
        if event.person_mode != PersonMode::Full {
            continue;
        }

        if let Err(error) = resolve_event_person(event, repo, retry_max, updates).await {
            return Err((index, error).into());
        }
    }

    Ok(buffer)
}

// Which distinct id this event asks to be linked with, if any
fn merge_target(event: &PreparedEvent) -> Option<String> {
    let key = match event.event.as_str() {
        "$identify" => "$anon_distinct_id",
        "$create_alias" | "$merge_dangerously" => "alias",
        _ => return None,
    };
    event
        .properties
        .get(key)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(String::from)
}

fn marks_identified(event: &PreparedEvent) -> bool {
    matches!(
        event.event.as_str(),
        "$identify" | "$create_alias" | "$merge_dangerously"
    )
}

async fn resolve_event_person(
    event: &mut PreparedEvent,
    repo: &dyn PersonRepo,
    retry_max: u32,
    updates: &mut Vec<PersonUpdate>,
) -> Result<(), UnhandledError> {
    let team_id = event.team.id;
    let ops = PropertyOps::from_properties(&event.properties);
    let identify = marks_identified(event);

    let mut person = repo.get_by_distinct_id(team_id, &event.distinct_id).await?;

    // Link or merge with the other distinct id first - how depends on which
    // sides already have a person
    let mut link_after_create = None;
    if let Some(other_id) = merge_target(event) {
        if other_id != event.distinct_id {
            match (
                person.take(),
                repo.get_by_distinct_id(team_id, &other_id).await?,
            ) {
                (Some(ours), Some(theirs)) if ours.id == theirs.id => {
                    // Already linked, the merge is a no-op
                    person = Some(ours);
                }
                (Some(_), Some(_)) => {
                    match repo.merge(team_id, &event.distinct_id, &other_id).await? {
                        Some(outcome) => {
                            counter!(PERSON_MERGES).increment(1);
                            updates.push(PersonUpdate::from_person(&outcome.survivor));
                            updates.push(PersonUpdate::tombstone(
                                outcome.deleted_uuid,
                                team_id,
                                outcome.deleted_created_at,
                                outcome.deleted_version,
                            ));
                            person = Some(outcome.survivor);
                        }
                        None => {
                            // A concurrent merge got there first - follow
                            // the survivor pointer once
                            person = repo.get_by_distinct_id(team_id, &event.distinct_id).await?;
                        }
                    }
                }
                (Some(ours), None) => {
                    repo.add_distinct_id(&ours, &other_id).await?;
                    person = Some(ours);
                }
                (None, Some(theirs)) => {
                    if repo.add_distinct_id(&theirs, &event.distinct_id).await? {
                        person = Some(theirs);
                    } else {
                        // Lost a race to map our own distinct id
                        person = repo.get_by_distinct_id(team_id, &event.distinct_id).await?;
                    }
                }
                (None, None) => {
                    link_after_create = Some(other_id);
                }
            }
        }
    }

    let mut person = match person {
        Some(person) => person,
        None => {
            // First sighting - create the person with this event's property
            // writes already applied
            let mut properties = Map::new();
            apply_property_ops(&mut properties, &ops);
            let outcome = repo
                .create(
                    team_id,
                    &event.distinct_id,
                    event.timestamp,
                    Value::Object(properties),
                    identify,
                )
                .await?;

            if outcome.created {
                counter!(PERSONS_CREATED).increment(1);
                updates.push(PersonUpdate::from_person(&outcome.person));
            }
            if let Some(other_id) = link_after_create {
                repo.add_distinct_id(&outcome.person, &other_id).await?;
            }

            if outcome.created {
                event.person = Some(outcome.person);
                return Ok(());
            }
            // Raced - fall through and apply our writes to the winner
            outcome.person
        }
    };

    if person.force_upgrade {
        // Migration marker: the person row is mid-upgrade, so property
        // writes are suppressed and the event is flagged downstream
        event.person_mode = PersonMode::ForceUpgrade;
        event.person = Some(person);
        return Ok(());
    }

    // Version-guarded write loop. On conflict we re-read (the mapping may
    // have moved under a merge) and retry, bounded by retry_max.
    let mut attempts = 0;
    loop {
        let mut properties = match &person.properties {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let changed = apply_property_ops(&mut properties, &ops);
        let is_identified = person.is_identified || identify;

        if !changed && is_identified == person.is_identified {
            break;
        }

        match repo
            .try_update(&person, Value::Object(properties), is_identified)
            .await?
        {
            Some(updated) => {
                updates.push(PersonUpdate::from_person(&updated));
                person = updated;
                break;
            }
            None => {
                counter!(PERSON_UPDATE_RETRIES).increment(1);
                attempts += 1;
                if attempts >= retry_max {
                    return Err(UnhandledError::PersonUpdateConflict {
                        team_id,
                        distinct_id: event.distinct_id.clone(),
                    });
                }
                person = repo
                    .get_by_distinct_id(team_id, &event.distinct_id)
                    .await?
                    .ok_or_else(|| UnhandledError::PersonUpdateConflict {
                        team_id,
                        distinct_id: event.distinct_id.clone(),
                    })?;
            }
        }
    }

    event.person = Some(person);
    Ok(())
}
