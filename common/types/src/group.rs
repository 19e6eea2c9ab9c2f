use sqlx::Postgres;

use crate::TeamId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct GroupType {
    pub group_type: String,
    pub group_type_index: i32,
    pub team_id: TeamId,
}

impl GroupType {
    pub async fn for_team<'c, E>(e: E, team_id: TeamId) -> Result<Vec<Self>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        sqlx::query_as::<_, Self>(
            "SELECT group_type, group_type_index, team_id FROM posthog_grouptypemapping WHERE team_id = $1",
        )
        .bind(team_id)
        .fetch_all(e)
        .await
    }

    pub async fn for_name<'c, E>(
        e: E,
        team_id: TeamId,
        name: &str,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        sqlx::query_as::<_, Self>(
            "SELECT group_type, group_type_index, team_id FROM posthog_grouptypemapping WHERE team_id = $1 AND group_type = $2",
        )
        .bind(team_id)
        .bind(name)
        .fetch_optional(e)
        .await
    }
}
