//! In-memory stand-ins for the postgres-backed stores, used by unit and
//! pipeline tests. They mirror the real repos' concurrency semantics
//! (converging creates, version-guarded updates, no-op repeat merges) so
//! identity scenarios can run without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_types::{GroupType, Person, PersonMode, Team, TeamId};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{
    config::{Config, SkipTokens},
    error::UnhandledError,
    groups::{GroupRepo, GroupTypeManager, GroupUpdate},
    persons::{
        apply_property_ops, choose_survivor, merged_properties, CreateOutcome, MergeOutcome,
        PersonRepo, PropertyOps,
    },
    pipeline::{prep::PrepSettings, PipelineContext, PreparedEvent},
    teams::{TeamManager, TeamSource},
};

pub fn team(id: TeamId, token: &str) -> Team {
    Team {
        id,
        project_id: Some(id as i64),
        api_token: token.to_string(),
        ..Default::default()
    }
}

pub fn person(team_id: TeamId, properties: Value) -> Person {
    Person {
        id: 1,
        created_at: Utc::now(),
        team_id,
        uuid: Uuid::now_v7(),
        properties,
        is_identified: false,
        is_user_id: None,
        version: 0,
        force_upgrade: false,
    }
}

pub fn prepared_event(team_id: TeamId, event: &str, distinct_id: &str) -> PreparedEvent {
    PreparedEvent {
        uuid: Uuid::now_v7(),
        team: team(team_id, "test-token"),
        event: event.to_string(),
        distinct_id: distinct_id.to_string(),
        timestamp: Utc::now(),
        properties: HashMap::new(),
        person_mode: PersonMode::Full,
        person: None,
    }
}

#[derive(Default)]
struct PersonStoreState {
    next_id: i64,
    persons: HashMap<i64, Person>,
    mappings: HashMap<(TeamId, String), i64>,
}

#[derive(Default)]
pub struct InMemoryPersonRepo {
    state: Mutex<PersonStoreState>,
    // Makes the next N try_update calls fail their version check, for
    // exercising the bounded retry loop
    conflict_next_updates: AtomicU32,
}

impl InMemoryPersonRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inject_update_conflicts(&self, count: u32) {
        self.conflict_next_updates.store(count, Ordering::SeqCst);
    }

    pub fn person_count(&self) -> usize {
        self.state.lock().unwrap().persons.len()
    }

    pub fn mapping_count(&self) -> usize {
        self.state.lock().unwrap().mappings.len()
    }

    pub fn person_for(&self, team_id: TeamId, distinct_id: &str) -> Option<Person> {
        let state = self.state.lock().unwrap();
        let id = state.mappings.get(&(team_id, distinct_id.to_string()))?;
        state.persons.get(id).cloned()
    }

    pub fn set_force_upgrade(&self, team_id: TeamId, distinct_id: &str) {
        let mut state = self.state.lock().unwrap();
        let id = *state
            .mappings
            .get(&(team_id, distinct_id.to_string()))
            .expect("person is mapped");
        state.persons.get_mut(&id).unwrap().force_upgrade = true;
    }

    /// Every `(team_id, distinct_id)` points at exactly one live person.
    pub fn assert_mappings_consistent(&self) {
        let state = self.state.lock().unwrap();
        for ((team_id, distinct_id), person_id) in &state.mappings {
            let person = state
                .persons
                .get(person_id)
                .unwrap_or_else(|| panic!("dangling mapping {team_id}/{distinct_id}"));
            assert_eq!(person.team_id, *team_id);
        }
    }
}

#[async_trait]
impl PersonRepo for InMemoryPersonRepo {
    async fn get_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, UnhandledError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .mappings
            .get(&(team_id, distinct_id.to_string()))
            .and_then(|id| state.persons.get(id))
            .cloned())
    }

    async fn create(
        &self,
        team_id: TeamId,
        distinct_id: &str,
        created_at: DateTime<Utc>,
        properties: Value,
        is_identified: bool,
    ) -> Result<CreateOutcome, UnhandledError> {
        let mut state = self.state.lock().unwrap();
        let key = (team_id, distinct_id.to_string());
        if let Some(existing) = state.mappings.get(&key) {
            let person = state.persons[existing].clone();
            return Ok(CreateOutcome {
                person,
                created: false,
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        let person = Person {
            id,
            created_at,
            team_id,
            uuid: Uuid::now_v7(),
            properties,
            is_identified,
            is_user_id: None,
            version: 0,
            force_upgrade: false,
        };
        state.persons.insert(id, person.clone());
        state.mappings.insert(key, id);
        Ok(CreateOutcome {
            person,
            created: true,
        })
    }

    async fn add_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<bool, UnhandledError> {
        let mut state = self.state.lock().unwrap();
        let key = (person.team_id, distinct_id.to_string());
        if state.mappings.contains_key(&key) {
            return Ok(false);
        }
        state.mappings.insert(key, person.id);
        Ok(true)
    }

    async fn try_update(
        &self,
        person: &Person,
        properties: Value,
        is_identified: bool,
    ) -> Result<Option<Person>, UnhandledError> {
        if self
            .conflict_next_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }

        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.persons.get_mut(&person.id) else {
            return Ok(None);
        };
        if stored.version != person.version {
            return Ok(None);
        }
        stored.properties = properties;
        stored.is_identified = is_identified;
        stored.version += 1;
        Ok(Some(stored.clone()))
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

        let mut state = self.state.lock().unwrap();
        let id_a = state.mappings.get(&(team_id, distinct_id_a.to_string()));
        let id_b = state.mappings.get(&(team_id, distinct_id_b.to_string()));
        let (Some(&id_a), Some(&id_b)) = (id_a, id_b) else {
            return Ok(None);
        };
        if id_a == id_b {
            return Ok(None);
        }

        let person_a = state.persons[&id_a].clone();
        let person_b = state.persons[&id_b].clone();
        let (survivor, loser) = choose_survivor(&person_a, &person_b);
        let merged = merged_properties(survivor, loser);
        let created_at = survivor.created_at.min(loser.created_at);
        let (survivor_id, loser_id) = (survivor.id, loser.id);
        let outcome_loser = (loser.uuid, loser.created_at, loser.version);

        for mapped in state.mappings.values_mut() {
            if *mapped == loser_id {
                *mapped = survivor_id;
            }
        }
        state.persons.remove(&loser_id);

        let survivor = state.persons.get_mut(&survivor_id).unwrap();
        survivor.properties = merged;
        survivor.created_at = created_at;
        survivor.is_identified = true;
        survivor.version += 1;
        let survivor = survivor.clone();

        Ok(Some(MergeOutcome {
            survivor,
            deleted_uuid: outcome_loser.0,
            deleted_created_at: outcome_loser.1,
            deleted_version: outcome_loser.2,
        }))
    }
}

#[derive(Default)]
struct GroupStoreState {
    group_types: HashMap<TeamId, Vec<GroupType>>,
    groups: HashMap<(TeamId, i32, String), (Value, DateTime<Utc>, i64)>,
}

#[derive(Default)]
pub struct InMemoryGroupRepo {
    state: Mutex<GroupStoreState>,
}

impl InMemoryGroupRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn group_properties(&self, team_id: TeamId, index: i32, key: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        state
            .groups
            .get(&(team_id, index, key.to_string()))
            .map(|(props, _, _)| props.clone())
    }
}

#[async_trait]
impl GroupRepo for InMemoryGroupRepo {
    async fn group_types_for_team(
        &self,
        team_id: TeamId,
    ) -> Result<Vec<GroupType>, UnhandledError> {
        let state = self.state.lock().unwrap();
        Ok(state.group_types.get(&team_id).cloned().unwrap_or_default())
    }

    async fn insert_group_type(
        &self,
        team_id: TeamId,
        name: &str,
        max_types: i32,
    ) -> Result<Option<i32>, UnhandledError> {
        let mut state = self.state.lock().unwrap();
        let types = state.group_types.entry(team_id).or_default();
        if let Some(existing) = types.iter().find(|t| t.group_type == name) {
            return Ok(Some(existing.group_type_index));
        }
        if types.len() as i32 >= max_types {
            return Ok(None);
        }
        let index = types.len() as i32;
        types.push(GroupType {
            group_type: name.to_string(),
            group_type_index: index,
            team_id,
        });
        Ok(Some(index))
    }

    async fn upsert_group(
        &self,
        team_id: TeamId,
        group_type_index: i32,
        group_key: &str,
        ops: &PropertyOps,
        timestamp: DateTime<Utc>,
    ) -> Result<GroupUpdate, UnhandledError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .groups
            .entry((team_id, group_type_index, group_key.to_string()))
            .or_insert_with(|| (json!({}), timestamp, 0));

        let mut properties = match &entry.0 {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        apply_property_ops(&mut properties, ops);
        entry.0 = Value::Object(properties);
        entry.2 += 1;

        Ok(GroupUpdate {
            team_id,
            group_type_index,
            group_key: group_key.to_string(),
            group_properties: serde_json::to_string(&entry.0)?,
            created_at: entry.1,
            version: entry.2,
        })
    }
}

pub struct InMemoryTeamSource {
    teams: Vec<Team>,
}

impl InMemoryTeamSource {
    pub fn new(teams: Vec<Team>) -> Arc<Self> {
        Arc::new(Self { teams })
    }
}

#[async_trait]
impl TeamSource for InMemoryTeamSource {
    async fn team_by_token(&self, token: &str) -> Result<Option<Team>, UnhandledError> {
        Ok(self.teams.iter().find(|t| t.api_token == token).cloned())
    }

    async fn team_by_id(&self, id: TeamId) -> Result<Option<Team>, UnhandledError> {
        Ok(self.teams.iter().find(|t| t.id == id).cloned())
    }
}

fn test_config() -> Config {
    // Deterministic config without touching the environment
    Config {
        host: "::".to_string(),
        port: 0,
        kafka: common_kafka::config::KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 10,
            kafka_message_timeout_ms: 1000,
            kafka_compression_codec: "none".to_string(),
            kafka_tls: false,
            kafka_hosts: "localhost:9092".to_string(),
        },
        consumer: common_kafka::config::ConsumerConfig {
            kafka_consumer_group: "test".to_string(),
            kafka_consumer_topic: "test".to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_consumer_auto_commit_interval_ms: 5000,
        },
        enriched_events_topic: "clickhouse_events_json".to_string(),
        ingestion_warnings_topic: "clickhouse_ingestion_warnings".to_string(),
        heatmaps_topic: "clickhouse_heatmap_events".to_string(),
        exceptions_topic: "exception_symbolification_events".to_string(),
        persons_topic: "clickhouse_person".to_string(),
        groups_topic: "clickhouse_groups".to_string(),
        dlq_topic: "events_plugin_ingestion_dlq".to_string(),
        database_url: String::new(),
        max_pg_connections: 1,
        max_events_per_batch: 1000,
        max_event_batch_wait_seconds: 1,
        person_resolution_retry_max: 5,
        pipeline_retry_max: 3,
        team_cache_ttl_ms: 30_000,
        max_team_cache_size: 1000,
        max_group_types_per_team: 5,
        max_group_type_cache_size: 1000,
        drain_timeout_ms: 1000,
        timestamp_future_tolerance_ms: 23 * 3600 * 1000,
        persons_processing_skip_tokens: String::new(),
    }
}

pub struct TestPipeline {
    pub context: PipelineContext,
    pub person_repo: Arc<InMemoryPersonRepo>,
    pub group_repo: Arc<InMemoryGroupRepo>,
}

/// A fully in-memory pipeline context, for driving handle_batch in tests.
pub fn test_pipeline(teams: Vec<Team>) -> TestPipeline {
    let config = test_config();
    let person_repo = InMemoryPersonRepo::new();
    let group_repo = InMemoryGroupRepo::new();
    let team_manager = Arc::new(TeamManager::new(&config, InMemoryTeamSource::new(teams)));

    let context = PipelineContext {
        team_manager,
        person_repo: person_repo.clone(),
        group_repo: group_repo.clone(),
        group_type_manager: GroupTypeManager::new(&config),
        transformers: Vec::new(),
        settings: PrepSettings {
            timestamp_future_tolerance_ms: config.timestamp_future_tolerance_ms,
            skip_tokens: SkipTokens::default(),
        },
        person_resolution_retry_max: config.person_resolution_retry_max,
    };

    TestPipeline {
        context,
        person_repo,
        group_repo,
    }
}
