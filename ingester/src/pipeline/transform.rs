use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common_types::TeamId;
use metrics::counter;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tracing::warn;

use crate::{
    error::{EventError, StageResult},
    metric_consts::TRANSFORMATION_OUTCOME,
    pipeline::PreparedEvent,
};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransformError(pub String);

/// User-configured event transformations. Each one can mutate the event,
/// drop it (by returning None), or fail - a failure is logged and counted,
/// and the pre-transform event continues down the chain.
#[async_trait]
pub trait EventTransformer: Send + Sync {
    fn name(&self) -> &str;

    async fn transform(
        &self,
        event: PreparedEvent,
    ) -> Result<Option<PreparedEvent>, TransformError>;
}

pub async fn apply_transformations(
    buffer: Vec<StageResult>,
    transformers: &[Arc<dyn EventTransformer>],
) -> Vec<StageResult> {
    if transformers.is_empty() {
        return buffer;
    }

    let mut out = Vec::with_capacity(buffer.len());
    'events: for item in buffer {
        let Ok(mut event) = item else {
            out.push(item);
            continue;
        };

        for transformer in transformers {
            let pre_transform = event.clone();
            match transformer.transform(event).await {
                Ok(Some(transformed)) => {
                    counter!(TRANSFORMATION_OUTCOME, "outcome" => "success").increment(1);
                    event = transformed;
                }
                Ok(None) => {
                    counter!(TRANSFORMATION_OUTCOME, "outcome" => "dropped").increment(1);
                    out.push(Err(EventError::TransformationDropped(pre_transform.uuid)));
                    continue 'events;
                }
                Err(e) => {
                    warn!(
                        event_uuid = %pre_transform.uuid,
                        transformer = transformer.name(),
                        "transformation failed: {e}"
                    );
                    counter!(TRANSFORMATION_OUTCOME, "outcome" => "failed").increment(1);
                    event = pre_transform;
                }
            }
        }

        out.push(Ok(event));
    }

    out
}

/// The built-in transformation: per-team property scrubbing, configured
/// through the property-filter rows in posthog_pluginconfig. Listed keys
/// are removed from the event's properties and from its $set / $set_once
/// payloads.
pub struct PropertyFilterTransformer {
    filtered: HashMap<TeamId, Vec<String>>,
}

impl PropertyFilterTransformer {
    pub fn new(filtered: HashMap<TeamId, Vec<String>>) -> Self {
        Self { filtered }
    }

    /// Best-effort load at startup. A failed read just disables filtering
    /// rather than blocking ingestion.
    pub async fn from_plugin_configs(pool: &PgPool) -> Self {
        let rows: Vec<(TeamId, Value)> = match sqlx::query_as(
            "SELECT team_id, config FROM posthog_pluginconfig WHERE enabled = true AND config ? 'properties'",
        )
        .fetch_all(pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("failed to load property filter configs: {e}");
                Vec::new()
            }
        };

        let mut filtered: HashMap<TeamId, Vec<String>> = HashMap::new();
        for (team_id, config) in rows {
            let Some(properties) = config.get("properties").and_then(Value::as_str) else {
                continue;
            };
            filtered.entry(team_id).or_default().extend(
                properties
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty()),
            );
        }

        Self { filtered }
    }
}

#[async_trait]
impl EventTransformer for PropertyFilterTransformer {
    fn name(&self) -> &str {
        "property-filter"
    }

    async fn transform(
        &self,
        mut event: PreparedEvent,
    ) -> Result<Option<PreparedEvent>, TransformError> {
        let Some(keys) = self.filtered.get(&event.team.id) else {
            return Ok(Some(event));
        };

        for key in keys {
            event.properties.remove(key);
            for bag in ["$set", "$set_once"] {
                if let Some(Value::Object(map)) = event.properties.get_mut(bag) {
                    map.remove(key);
                }
            }
        }

        Ok(Some(event))
    }
}
