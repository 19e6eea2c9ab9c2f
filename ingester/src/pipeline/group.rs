use std::collections::HashMap;

use common_types::PersonMode;
use metrics::counter;
use serde_json::{json, Value};

use crate::{
    error::{PipelineFailure, StageResult, UnhandledError},
    groups::{GroupRepo, GroupTypeManager, GroupUpdate},
    metric_consts::GROUP_UPDATES_WRITTEN,
    persons::PropertyOps,
    pipeline::PreparedEvent,
};

/// Resolve group-type names to indices and fold `$group_<i>` keys into the
/// event, and upsert group rows on $groupidentify. Group processing rides
/// on person processing, so personless events skip this stage entirely.
pub async fn process_groups(
    mut buffer: Vec<StageResult>,
    manager: &GroupTypeManager,
    repo: &dyn GroupRepo,
    updates: &mut Vec<GroupUpdate>,
) -> Result<Vec<StageResult>, PipelineFailure> {
    for (index, item) in buffer.iter_mut().enumerate() {
        let Ok(event) = item else {
            continue;
        };
        if event.person_mode != PersonMode::Full {
            continue;
        }

        if event.event == "$groupidentify" {
            if let Err(error) = handle_groupidentify(event, manager, repo, updates).await {
                return Err((index, error).into());
            }
        }

        if let Err(error) = map_group_keys(event, manager, repo).await {
            return Err((index, error).into());
        }
    }

    Ok(buffer)
}

async fn handle_groupidentify(
    event: &mut PreparedEvent,
    manager: &GroupTypeManager,
    repo: &dyn GroupRepo,
    updates: &mut Vec<GroupUpdate>,
) -> Result<(), UnhandledError> {
    let Some(group_type) = event
        .properties
        .get("$group_type")
        .and_then(Value::as_str)
        .map(String::from)
    else {
        return Ok(());
    };
    let Some(group_key) = event
        .properties
        .get("$group_key")
        .map(stringify_key)
        .filter(|k| !k.is_empty())
    else {
        return Ok(());
    };

    let Some(index) = manager.resolve(repo, event.team.id, &group_type).await? else {
        // Team is at its group-type cap: the identify is ignored and no
        // $group_<i> key gets set
        return Ok(());
    };

    let ops = PropertyOps {
        set: grab_object(&event.properties, "$group_set"),
        set_once: grab_object(&event.properties, "$group_set_once"),
        unset: Vec::new(),
    };

    let update = repo
        .upsert_group(event.team.id, index, &group_key, &ops, event.timestamp)
        .await?;
    counter!(GROUP_UPDATES_WRITTEN).increment(1);
    updates.push(update);

    event
        .properties
        .insert(format!("$group_{index}"), json!(group_key));

    Ok(())
}

async fn map_group_keys(
    event: &mut PreparedEvent,
    manager: &GroupTypeManager,
    repo: &dyn GroupRepo,
) -> Result<(), UnhandledError> {
    let groups = match event.properties.get("$groups") {
        Some(Value::Object(groups)) => groups.clone(),
        // Invalid shapes (say, an array) just skip group identification
        _ => return Ok(()),
    };

    let mut indexed = HashMap::new();
    for (group_type, group_key) in &groups {
        let key = stringify_key(group_key);
        if key.is_empty() {
            continue;
        }
        if let Some(index) = manager.resolve(repo, event.team.id, group_type).await? {
            indexed.insert(format!("$group_{index}"), json!(key));
        }
    }

    event.properties.extend(indexed);

    Ok(())
}

fn grab_object(properties: &HashMap<String, Value>, key: &str) -> HashMap<String, Value> {
    match properties.get(key) {
        Some(Value::Object(map)) => map.clone().into_iter().collect(),
        _ => HashMap::new(),
    }
}

// Group keys are strings on the wire, but SDKs send numbers too
fn stringify_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
