use serde::{Deserialize, Serialize};
use sqlx::Postgres;

pub type TeamId = i32;
pub type ProjectId = i64;

// The subset of the team row the pipeline needs. Teams are read-only from
// the pipeline's point of view.
#[derive(Debug, Clone, Default, Deserialize, Serialize, sqlx::FromRow)]
pub struct Team {
    pub id: TeamId,
    pub project_id: Option<ProjectId>,
    pub api_token: String,
    pub anonymize_ips: bool,
    pub person_processing_opt_out: Option<bool>,
    pub heatmaps_opt_in: Option<bool>,
    pub ingested_event: bool,
}

const TEAM_COLUMNS: &str =
    "id, project_id, api_token, anonymize_ips, person_processing_opt_out, heatmaps_opt_in, ingested_event";

impl Team {
    pub fn project_id(&self) -> ProjectId {
        // Rows from before the environments migration have no project_id, in
        // which case the team id doubles as one
        self.project_id.unwrap_or(self.id as ProjectId)
    }

    pub async fn load<'c, E>(e: E, id: TeamId) -> Result<Option<Team>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let query = format!("SELECT {TEAM_COLUMNS} FROM posthog_team WHERE id = $1 LIMIT 1");
        sqlx::query_as::<_, Team>(&query)
            .bind(id)
            .fetch_optional(e)
            .await
    }

    pub async fn load_by_token<'c, E>(e: E, token: &str) -> Result<Option<Team>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let query = format!("SELECT {TEAM_COLUMNS} FROM posthog_team WHERE api_token = $1 LIMIT 1");
        sqlx::query_as::<_, Team>(&query)
            .bind(token)
            .fetch_optional(e)
            .await
    }
}
