use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_types::{Person, TeamId};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::UnhandledError;

// Property writes on a person, parsed out of event properties. $set
// overwrites, $set_once only fills absent keys, $unset removes.
#[derive(Debug, Clone, Default)]
pub struct PropertyOps {
    pub set: HashMap<String, Value>,
    pub set_once: HashMap<String, Value>,
    pub unset: Vec<String>,
}

impl PropertyOps {
    pub fn from_properties(properties: &HashMap<String, Value>) -> Self {
        let grab_map = |key: &str| -> HashMap<String, Value> {
            match properties.get(key) {
                Some(Value::Object(map)) => map.clone().into_iter().collect(),
                _ => HashMap::new(),
            }
        };

        let unset = match properties.get("$unset") {
            Some(Value::Array(keys)) => keys
                .iter()
                .filter_map(|k| k.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };

        Self {
            set: grab_map("$set"),
            set_once: grab_map("$set_once"),
            unset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.set_once.is_empty() && self.unset.is_empty()
    }
}

/// Apply the ops to a property map, returning whether anything changed.
/// Replaying the same ops is a no-op, which is what makes person writes
/// safe to retry.
pub fn apply_property_ops(target: &mut Map<String, Value>, ops: &PropertyOps) -> bool {
    let mut changed = false;

    for (key, value) in &ops.set_once {
        if !target.contains_key(key) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    for (key, value) in &ops.set {
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    for key in &ops.unset {
        if target.remove(key).is_some() {
            changed = true;
        }
    }

    changed
}

/// Pick the surviving side of a merge: greatest `is_identified`, then
/// earliest `created_at`, then lexicographically smallest uuid, so that
/// concurrent mergers agree on the outcome.
pub fn choose_survivor<'a>(a: &'a Person, b: &'a Person) -> (&'a Person, &'a Person) {
    if a.is_identified != b.is_identified {
        return if a.is_identified { (a, b) } else { (b, a) };
    }
    if a.created_at != b.created_at {
        return if a.created_at < b.created_at {
            (a, b)
        } else {
            (b, a)
        };
    }
    if a.uuid <= b.uuid {
        (a, b)
    } else {
        (b, a)
    }
}

/// Union of both property maps, survivor winning conflicts and the loser's
/// keys filling holes.
pub fn merged_properties(survivor: &Person, loser: &Person) -> Value {
    let mut merged = match &loser.properties {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(survivor_props) = &survivor.properties {
        for (key, value) in survivor_props {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

// The person row as emitted to the ClickHouse-bound persons topic. Deleted
// persons get a version far ahead of any concurrent update, so the tombstone
// wins the replacing merge.
#[derive(Debug, Clone, Serialize)]
pub struct PersonUpdate {
    pub id: Uuid,
    pub team_id: TeamId,
    pub properties: String,
    pub is_identified: bool,
    #[serde(serialize_with = "common_kafka::kafka_messages::serialize_datetime")]
    pub created_at: DateTime<Utc>,
    pub version: i64,
    pub is_deleted: bool,
}

const DELETED_VERSION_BUMP: i64 = 100;

impl PersonUpdate {
    pub fn from_person(person: &Person) -> Self {
        Self {
            id: person.uuid,
            team_id: person.team_id,
            properties: serde_json::to_string(&person.properties)
                .expect("person properties are serializable"),
            is_identified: person.is_identified,
            created_at: person.created_at,
            version: person.version,
            is_deleted: false,
        }
    }

    pub fn tombstone(uuid: Uuid, team_id: TeamId, created_at: DateTime<Utc>, version: i64) -> Self {
        Self {
            id: uuid,
            team_id,
            properties: "{}".to_string(),
            is_identified: false,
            created_at,
            version: version + DELETED_VERSION_BUMP,
            is_deleted: true,
        }
    }
}

pub struct CreateOutcome {
    pub person: Person,
    pub created: bool,
}

pub struct MergeOutcome {
    pub survivor: Person,
    pub deleted_uuid: Uuid,
    pub deleted_created_at: DateTime<Utc>,
    pub deleted_version: i64,
}

/// Persistence seam for person identity resolution. All mutations are
/// either insert-where-absent or version-guarded, so replays converge.
#[async_trait]
pub trait PersonRepo: Send + Sync {
    async fn get_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, UnhandledError>;

    /// Create a person and map the distinct id to it. If another producer
    /// creates the mapping concurrently, the existing person is returned
    /// instead (`created: false`).
    async fn create(
        &self,
        team_id: TeamId,
        distinct_id: &str,
        created_at: DateTime<Utc>,
        properties: Value,
        is_identified: bool,
    ) -> Result<CreateOutcome, UnhandledError>;

    /// Map another distinct id onto an existing person. Returns false if
    /// the mapping already exists (possibly pointing elsewhere).
    async fn add_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<bool, UnhandledError>;

    /// Version-guarded property write. Returns None if the row moved under
    /// us, in which case the caller re-reads and retries.
    async fn try_update(
        &self,
        person: &Person,
        properties: Value,
        is_identified: bool,
    ) -> Result<Option<Person>, UnhandledError>;

    /// Merge the persons behind two distinct ids. Returns None when there
    /// is nothing to do (same person, or either side unmapped) - repeating
    /// a completed merge is a no-op.
    async fn merge(
        &self,
        team_id: TeamId,
        distinct_id_a: &str,
        distinct_id_b: &str,
    ) -> Result<Option<MergeOutcome>, UnhandledError>;
}

pub struct PostgresPersonRepo {
    pool: PgPool,
}

impl PostgresPersonRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PERSON_RETURNING: &str =
    "id, created_at, team_id, uuid, properties, is_identified, is_user_id, version, force_upgrade";

async fn lock_person_by_distinct_id(
    tx: &mut Transaction<'_, Postgres>,
    team_id: TeamId,
    distinct_id: &str,
) -> Result<Option<Person>, sqlx::Error> {
    let query = r#"
        SELECT p.id, p.created_at, p.team_id, p.uuid, p.properties, p.is_identified, p.is_user_id, p.version, p.force_upgrade
        FROM posthog_person p
        INNER JOIN posthog_persondistinctid d
            ON p.id = d.person_id
        WHERE
            d.distinct_id = $1
            AND d.team_id = $2
            AND p.team_id = $2
        LIMIT 1
        FOR UPDATE OF p
    "#;
    sqlx::query_as::<_, Person>(query)
        .bind(distinct_id)
        .bind(team_id)
        .fetch_optional(&mut **tx)
        .await
}

#[async_trait]
impl PersonRepo for PostgresPersonRepo {
    async fn get_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, UnhandledError> {
        Ok(Person::from_distinct_id(&self.pool, team_id, distinct_id).await?)
    }

    async fn create(
        &self,
        team_id: TeamId,
        distinct_id: &str,
        created_at: DateTime<Utc>,
        properties: Value,
        is_identified: bool,
    ) -> Result<CreateOutcome, UnhandledError> {
        let insert_person = format!(
            "INSERT INTO posthog_person (created_at, team_id, uuid, properties, is_identified, version, force_upgrade)
             VALUES ($1, $2, $3, $4, $5, 0, false)
             RETURNING {PERSON_RETURNING}"
        );

        // Two attempts: if we lose the mapping race, the second pass picks
        // up whatever the winner created.
        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let person = sqlx::query_as::<_, Person>(&insert_person)
                .bind(created_at)
                .bind(team_id)
                .bind(Uuid::now_v7())
                .bind(&properties)
                .bind(is_identified)
                .fetch_one(&mut *tx)
                .await?;

            let mapped = sqlx::query(
                "INSERT INTO posthog_persondistinctid (team_id, distinct_id, person_id, version)
                 VALUES ($1, $2, $3, 0)
                 ON CONFLICT (team_id, distinct_id) DO NOTHING",
            )
            .bind(team_id)
            .bind(distinct_id)
            .bind(person.id)
            .execute(&mut *tx)
            .await?;

            if mapped.rows_affected() == 1 {
                tx.commit().await?;
                return Ok(CreateOutcome {
                    person,
                    created: true,
                });
            }

            // Someone else mapped this distinct id first - drop our person
            // row and use theirs
            tx.rollback().await?;
            if let Some(existing) = self.get_by_distinct_id(team_id, distinct_id).await? {
                return Ok(CreateOutcome {
                    person: existing,
                    created: false,
                });
            }
        }

        Err(UnhandledError::Other(format!(
            "person create contention for team {team_id}"
        )))
    }

    async fn add_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<bool, UnhandledError> {
        let result = sqlx::query(
            "INSERT INTO posthog_persondistinctid (team_id, distinct_id, person_id, version)
             VALUES ($1, $2, $3, 0)
             ON CONFLICT (team_id, distinct_id) DO NOTHING",
        )
        .bind(person.team_id)
        .bind(distinct_id)
        .bind(person.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_update(
        &self,
        person: &Person,
        properties: Value,
        is_identified: bool,
    ) -> Result<Option<Person>, UnhandledError> {
        let query = format!(
            "UPDATE posthog_person
             SET properties = $1, is_identified = $2, version = version + 1
             WHERE id = $3 AND version = $4
             RETURNING {PERSON_RETURNING}"
        );
        let updated = sqlx::query_as::<_, Person>(&query)
            .bind(&properties)
            .bind(is_identified)
            .bind(person.id)
            .bind(person.version)
            .fetch_optional(&self.pool)
            .await?;

        Ok(updated)
    }

    async fn merge(
        &self,
        team_id: TeamId,
        distinct_id_a: &str,
        distinct_id_b: &str,
    ) -> Result<Option<MergeOutcome>, UnhandledError> {
        if distinct_id_a == distinct_id_b {
            return Ok(None);
        }

        // Lock rows in sorted distinct-id order, so concurrent merges over
        // the same pair can't deadlock
        let (first, second) = if distinct_id_a <= distinct_id_b {
            (distinct_id_a, distinct_id_b)
        } else {
            (distinct_id_b, distinct_id_a)
        };

        let mut tx = self.pool.begin().await?;
        let person_first = lock_person_by_distinct_id(&mut tx, team_id, first).await?;
        let person_second = lock_person_by_distinct_id(&mut tx, team_id, second).await?;

        let (Some(person_first), Some(person_second)) = (person_first, person_second) else {
            tx.rollback().await?;
            return Ok(None);
        };

        if person_first.id == person_second.id {
            // Already merged, nothing to do
            tx.rollback().await?;
            return Ok(None);
        }

        let (survivor, loser) = choose_survivor(&person_first, &person_second);
        let merged = merged_properties(survivor, loser);
        let created_at = survivor.created_at.min(loser.created_at);

        sqlx::query(
            "UPDATE posthog_persondistinctid
             SET person_id = $1, version = version + 1
             WHERE team_id = $2 AND person_id = $3",
        )
        .bind(survivor.id)
        .bind(team_id)
        .bind(loser.id)
        .execute(&mut *tx)
        .await?;

        let update_survivor = format!(
            "UPDATE posthog_person
             SET properties = $1, created_at = $2, is_identified = true, version = version + 1
             WHERE id = $3
             RETURNING {PERSON_RETURNING}"
        );
        let updated = sqlx::query_as::<_, Person>(&update_survivor)
            .bind(&merged)
            .bind(created_at)
            .bind(survivor.id)
            .fetch_one(&mut *tx)
            .await?;

        let outcome = MergeOutcome {
            survivor: updated,
            deleted_uuid: loser.uuid,
            deleted_created_at: loser.created_at,
            deleted_version: loser.version,
        };

        sqlx::query("DELETE FROM posthog_person WHERE id = $1")
            .bind(loser.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(outcome))
    }
}
