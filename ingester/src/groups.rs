use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_types::{GroupType, TeamId};
use metrics::counter;
use moka::sync::{Cache, CacheBuilder};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::{
    config::Config,
    error::UnhandledError,
    metric_consts::GROUP_TYPES_CAPPED,
    persons::{apply_property_ops, PropertyOps},
};

// The group row as emitted to the ClickHouse-bound groups topic.
#[derive(Debug, Clone, Serialize)]
pub struct GroupUpdate {
    pub team_id: TeamId,
    pub group_type_index: i32,
    pub group_key: String,
    pub group_properties: String,
    #[serde(serialize_with = "common_kafka::kafka_messages::serialize_datetime")]
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

/// Persistence seam for group-type mappings and group rows.
#[async_trait]
pub trait GroupRepo: Send + Sync {
    async fn group_types_for_team(
        &self,
        team_id: TeamId,
    ) -> Result<Vec<GroupType>, UnhandledError>;

    /// Register a new group type at the next free index, unless the team is
    /// already at its cap, in which case None is returned and the type stays
    /// unmapped.
    async fn insert_group_type(
        &self,
        team_id: TeamId,
        name: &str,
        max_types: i32,
    ) -> Result<Option<i32>, UnhandledError>;

    /// Upsert a group row, applying $group_set over $group_set_once and
    /// bumping the version. `created_at` is only set on first insert.
    async fn upsert_group(
        &self,
        team_id: TeamId,
        group_type_index: i32,
        group_key: &str,
        ops: &PropertyOps,
        timestamp: DateTime<Utc>,
    ) -> Result<GroupUpdate, UnhandledError>;
}

pub struct PostgresGroupRepo {
    pool: PgPool,
}

impl PostgresGroupRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupRepo for PostgresGroupRepo {
    async fn group_types_for_team(
        &self,
        team_id: TeamId,
    ) -> Result<Vec<GroupType>, UnhandledError> {
        Ok(GroupType::for_team(&self.pool, team_id).await?)
    }

    async fn insert_group_type(
        &self,
        team_id: TeamId,
        name: &str,
        max_types: i32,
    ) -> Result<Option<i32>, UnhandledError> {
        // Two attempts, so losing an index race reads the winner's row
        for _ in 0..2 {
            let existing = self.group_types_for_team(team_id).await?;
            if let Some(found) = existing.iter().find(|t| t.group_type == name) {
                return Ok(Some(found.group_type_index));
            }
            if existing.len() as i32 >= max_types {
                return Ok(None);
            }

            let next_index = existing
                .iter()
                .map(|t| t.group_type_index + 1)
                .max()
                .unwrap_or(0);

            let inserted = sqlx::query(
                "INSERT INTO posthog_grouptypemapping (team_id, group_type, group_type_index)
                 VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING",
            )
            .bind(team_id)
            .bind(name)
            .bind(next_index)
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 1 {
                return Ok(Some(next_index));
            }
        }

        Err(UnhandledError::Other(format!(
            "group type mapping contention for team {team_id}"
        )))
    }

    async fn upsert_group(
        &self,
        team_id: TeamId,
        group_type_index: i32,
        group_key: &str,
        ops: &PropertyOps,
        timestamp: DateTime<Utc>,
    ) -> Result<GroupUpdate, UnhandledError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(Value, DateTime<Utc>, i64)> = sqlx::query_as(
            "SELECT group_properties, created_at, version
             FROM posthog_group
             WHERE team_id = $1 AND group_type_index = $2 AND group_key = $3
             FOR UPDATE",
        )
        .bind(team_id)
        .bind(group_type_index)
        .bind(group_key)
        .fetch_optional(&mut *tx)
        .await?;

        let update = match existing {
            Some((properties, created_at, version)) => {
                let mut merged = match properties {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                apply_property_ops(&mut merged, ops);
                let merged = Value::Object(merged);

                sqlx::query(
                    "UPDATE posthog_group
                     SET group_properties = $1, version = $2
                     WHERE team_id = $3 AND group_type_index = $4 AND group_key = $5",
                )
                .bind(&merged)
                .bind(version + 1)
                .bind(team_id)
                .bind(group_type_index)
                .bind(group_key)
                .execute(&mut *tx)
                .await?;

                GroupUpdate {
                    team_id,
                    group_type_index,
                    group_key: group_key.to_string(),
                    group_properties: serde_json::to_string(&merged)?,
                    created_at,
                    version: version + 1,
                }
            }
            None => {
                let mut properties = Map::new();
                apply_property_ops(&mut properties, ops);
                let properties = Value::Object(properties);

                sqlx::query(
                    "INSERT INTO posthog_group (team_id, group_type_index, group_key, group_properties, created_at, version)
                     VALUES ($1, $2, $3, $4, $5, 1)",
                )
                .bind(team_id)
                .bind(group_type_index)
                .bind(group_key)
                .bind(&properties)
                .bind(timestamp)
                .execute(&mut *tx)
                .await?;

                GroupUpdate {
                    team_id,
                    group_type_index,
                    group_key: group_key.to_string(),
                    group_properties: serde_json::to_string(&properties)?,
                    created_at: timestamp,
                    version: 1,
                }
            }
        };

        tx.commit().await?;
        Ok(update)
    }
}

/// Cached group-type index resolution. Teams change their group types
/// rarely, so a short-TTL map per team keeps the hot path off the database;
/// the cache is invalidated whenever we register a new type.
pub struct GroupTypeManager {
    cache: Cache<TeamId, Arc<HashMap<String, i32>>>,
    max_group_types: i32,
}

impl GroupTypeManager {
    pub fn new(config: &Config) -> Self {
        let cache = CacheBuilder::new(config.max_group_type_cache_size)
            .time_to_live(Duration::from_millis(config.team_cache_ttl_ms))
            .build();

        Self {
            cache,
            max_group_types: config.max_group_types_per_team,
        }
    }

    pub async fn resolve(
        &self,
        repo: &dyn GroupRepo,
        team_id: TeamId,
        group_type: &str,
    ) -> Result<Option<i32>, UnhandledError> {
        let mapping = match self.cache.get(&team_id) {
            Some(mapping) => mapping,
            None => {
                let loaded: HashMap<String, i32> = repo
                    .group_types_for_team(team_id)
                    .await?
                    .into_iter()
                    .map(|t| (t.group_type, t.group_type_index))
                    .collect();
                let loaded = Arc::new(loaded);
                self.cache.insert(team_id, loaded.clone());
                loaded
            }
        };

        if let Some(index) = mapping.get(group_type) {
            return Ok(Some(*index));
        }

        // Unknown type - at the cap this is a cheap map check, under it we
        // register the type and refresh the cached mapping
        if mapping.len() as i32 >= self.max_group_types {
            counter!(GROUP_TYPES_CAPPED).increment(1);
            return Ok(None);
        }

        let inserted = repo
            .insert_group_type(team_id, group_type, self.max_group_types)
            .await?;
        self.cache.invalidate(&team_id);

        if inserted.is_none() {
            counter!(GROUP_TYPES_CAPPED).increment(1);
        }

        Ok(inserted)
    }
}
