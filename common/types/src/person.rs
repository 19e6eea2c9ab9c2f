use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Postgres;
use uuid::Uuid;

use crate::TeamId;

pub type PersonId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Person {
    pub id: PersonId,
    pub created_at: DateTime<Utc>,
    pub team_id: TeamId,
    pub uuid: Uuid,
    pub properties: Value,
    pub is_identified: bool,
    pub is_user_id: Option<i32>,
    pub version: i64,
    pub force_upgrade: bool,
}

const PERSON_COLUMNS: &str = "p.id, p.created_at, p.team_id, p.uuid, p.properties, p.is_identified, p.is_user_id, p.version, p.force_upgrade";

impl Person {
    pub async fn from_distinct_id<'c, E>(
        e: E,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let query = format!(
            r#"
                SELECT {PERSON_COLUMNS}
                FROM posthog_person p
                INNER JOIN posthog_persondistinctid d
                    ON p.id = d.person_id
                WHERE
                    d.distinct_id = $1
                    AND d.team_id = $2
                    AND p.team_id = $2
                LIMIT 1
            "#
        );
        sqlx::query_as::<_, Person>(&query)
            .bind(distinct_id)
            .bind(team_id)
            .fetch_optional(e)
            .await
    }
}
