use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use common_types::{RawEvent, Team, TeamId};
use moka::future::{Cache, CacheBuilder};
use sqlx::PgPool;

use crate::{config::Config, error::UnhandledError, sanitize_string, WithIndices};

/// Where teams actually come from. The pipeline only ever reads teams, so
/// this is a lookup-only seam.
#[async_trait]
pub trait TeamSource: Send + Sync {
    async fn team_by_token(&self, token: &str) -> Result<Option<Team>, UnhandledError>;
    async fn team_by_id(&self, id: TeamId) -> Result<Option<Team>, UnhandledError>;
}

pub struct PostgresTeamSource {
    pool: PgPool,
}

impl PostgresTeamSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TeamSource for PostgresTeamSource {
    async fn team_by_token(&self, token: &str) -> Result<Option<Team>, UnhandledError> {
        Ok(Team::load_by_token(&self.pool, token).await?)
    }

    async fn team_by_id(&self, id: TeamId) -> Result<Option<Team>, UnhandledError> {
        Ok(Team::load(&self.pool, id).await?)
    }
}

/// TTL-cached team lookups, keyed by both api token and team id. We cache
/// "no team" results too, so unknown tokens don't hammer the database, and
/// `try_get_with` collapses concurrent refreshes of the same key into a
/// single load.
pub struct TeamManager {
    source: Arc<dyn TeamSource>,
    by_token: Cache<String, Option<Team>>,
    by_id: Cache<TeamId, Option<Team>>,
}

impl TeamManager {
    pub fn new(config: &Config, source: Arc<dyn TeamSource>) -> Self {
        let ttl = Duration::from_millis(config.team_cache_ttl_ms);
        let by_token = CacheBuilder::new(config.max_team_cache_size)
            .time_to_live(ttl)
            .build();
        let by_id = CacheBuilder::new(config.max_team_cache_size)
            .time_to_live(ttl)
            .build();

        Self {
            source,
            by_token,
            by_id,
        }
    }

    pub async fn by_token(&self, token: &str) -> Result<Option<Team>, UnhandledError> {
        // Tokens with null bytes can't match anything in postgres, and we'd
        // rather fail the lookup than the query
        let token = sanitize_string(token.to_string());
        let source = self.source.clone();
        self.by_token
            .try_get_with(token.clone(), async move {
                source.team_by_token(&token).await
            })
            .await
            .map_err(|e| UnhandledError::Other(e.to_string()))
    }

    pub async fn by_id(&self, id: TeamId) -> Result<Option<Team>, UnhandledError> {
        let source = self.source.clone();
        self.by_id
            .try_get_with(id, async move { source.team_by_id(id).await })
            .await
            .map_err(|e| UnhandledError::Other(e.to_string()))
    }
}

/// How an event identifies its team. Token wins when both are present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TeamRef {
    Token(String),
    Id(TeamId),
}

impl TeamRef {
    /// All the ways this event identifies its team, token first. The
    /// prepare stage falls back through these in order, so a stale token
    /// on an event that also carries a team_id still resolves.
    pub fn refs_for_event(event: &RawEvent) -> Vec<Self> {
        let mut refs = Vec::with_capacity(2);
        if let Some(token) = event.extract_token() {
            refs.push(TeamRef::Token(sanitize_string(token)));
        }
        if let Some(id) = event.team_id {
            refs.push(TeamRef::Id(id));
        }
        refs
    }
}

pub async fn do_team_lookups(
    manager: Arc<TeamManager>,
    events: &[RawEvent],
) -> Result<HashMap<TeamRef, Option<Team>>, (usize, UnhandledError)> {
    let mut team_lookups: HashMap<TeamRef, WithIndices<_>> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        // Token-less, id-less events get dropped by the prepare stage
        for team_ref in TeamRef::refs_for_event(event) {
            if let Some(lookup) = team_lookups.get_mut(&team_ref) {
                lookup.indices.push(index);
                continue;
            }

            let m_manager = manager.clone();
            let m_ref = team_ref.clone();
            let fut = async move {
                match m_ref {
                    TeamRef::Token(token) => m_manager.by_token(&token).await,
                    TeamRef::Id(id) => m_manager.by_id(id).await,
                }
            };
            let lookup = WithIndices {
                indices: vec![index],
                inner: tokio::spawn(fut),
            };
            team_lookups.insert(team_ref, lookup);
        }
    }

    let mut results = HashMap::new();
    for (team_ref, lookup) in team_lookups {
        let (indices, task) = (lookup.indices, lookup.inner);
        match task.await.expect("Task was not cancelled") {
            Ok(maybe_team) => results.insert(team_ref, maybe_team),
            Err(err) => return Err((indices[0], err)),
        };
    }

    Ok(results)
}
