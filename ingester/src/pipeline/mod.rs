use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_kafka::kafka_messages::ingest_warning::IngestionWarning;
use common_types::{Person, PersonMode, Team};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{PipelineFailure, PipelineResult},
    groups::{GroupRepo, GroupTypeManager, GroupUpdate},
    metric_consts::{
        GROUP_PROCESSING_TIME, PERSON_PROCESSING_TIME, PREPARE_EVENTS_TIME, TEAM_LOOKUP_TIME,
    },
    persons::{PersonRepo, PersonUpdate},
    pipeline::{heatmap::HeatmapEvent, prep::PrepSettings, transform::EventTransformer},
    teams::{do_team_lookups, TeamManager},
};

pub mod ai;
pub mod assemble;
pub mod errors;
pub mod group;
pub mod heatmap;
pub mod person;
pub mod prep;
pub mod transform;

pub use common_types::RawEvent;

/// An event that has made it through validation and normalization, on its
/// way to becoming a ClickHouseEvent. Stages mutate this in place.
#[derive(Debug, Clone)]
pub struct PreparedEvent {
    pub uuid: Uuid,
    pub team: Team,
    pub event: String,
    pub distinct_id: String,
    pub timestamp: DateTime<Utc>,
    pub properties: HashMap<String, Value>,
    pub person_mode: PersonMode,
    // Attached by the person stage - the post-event person snapshot
    pub person: Option<Person>,
}

/// Everything a batch wants written besides the enriched events themselves.
/// The consumer queues all of these onto their topics and awaits every
/// delivery before storing offsets.
#[derive(Debug, Default)]
pub struct SideEffects {
    pub warnings: Vec<IngestionWarning>,
    pub heatmaps: Vec<(Uuid, HeatmapEvent)>,
    pub person_updates: Vec<PersonUpdate>,
    pub group_updates: Vec<GroupUpdate>,
}

#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub results: Vec<PipelineResult>,
    pub side_effects: SideEffects,
}

/// The shared state every stage gets access to. Constructed once at startup
/// (or from fakes, in tests) - no process-wide singletons.
pub struct PipelineContext {
    pub team_manager: Arc<TeamManager>,
    pub person_repo: Arc<dyn PersonRepo>,
    pub group_repo: Arc<dyn GroupRepo>,
    pub group_type_manager: GroupTypeManager,
    pub transformers: Vec<Arc<dyn EventTransformer>>,
    pub settings: PrepSettings,
    pub person_resolution_retry_max: u32,
}

/// Drive a batch of raw events through the per-event state machine. Every
/// input slot maps to exactly one output slot: either an enriched event or
/// a typed drop. Retryable failures surface as a PipelineFailure carrying
/// the index of the offending message.
pub async fn handle_batch(
    events: Vec<RawEvent>,
    context: &PipelineContext,
) -> Result<PipelineOutput, PipelineFailure> {
    let start_count = events.len();
    let mut side_effects = SideEffects::default();

    let team_lookup = common_metrics::timing_guard(TEAM_LOOKUP_TIME, &[]);
    let teams_lut = do_team_lookups(context.team_manager.clone(), &events).await?;
    team_lookup.fin();

    let prep_time = common_metrics::timing_guard(PREPARE_EVENTS_TIME, &[]);
    let buffer = prep::prepare_events(
        events,
        &teams_lut,
        &context.settings,
        &mut side_effects.warnings,
    );
    assert_eq!(start_count, buffer.len());
    prep_time.fin();

    // $$heatmap events skip everything below - they only ever fan out to
    // the heatmaps topic
    let buffer = heatmap::process_fast_path(
        buffer,
        &mut side_effects.warnings,
        &mut side_effects.heatmaps,
    );
    assert_eq!(start_count, buffer.len());

    let buffer = transform::apply_transformations(buffer, &context.transformers).await;
    assert_eq!(start_count, buffer.len());

    let buffer = ai::process_ai_events(buffer);
    assert_eq!(start_count, buffer.len());

    let person_time = common_metrics::timing_guard(PERSON_PROCESSING_TIME, &[]);
    let buffer = person::process_people(
        buffer,
        context.person_repo.as_ref(),
        context.person_resolution_retry_max,
        &mut side_effects.person_updates,
    )
    .await?;
    assert_eq!(start_count, buffer.len());
    person_time.fin();

    let group_time = common_metrics::timing_guard(GROUP_PROCESSING_TIME, &[]);
    let buffer = group::process_groups(
        buffer,
        &context.group_type_manager,
        context.group_repo.as_ref(),
        &mut side_effects.group_updates,
    )
    .await?;
    assert_eq!(start_count, buffer.len());
    group_time.fin();

    let buffer = heatmap::process_embedded(
        buffer,
        &mut side_effects.warnings,
        &mut side_effects.heatmaps,
    );
    assert_eq!(start_count, buffer.len());

    let results = assemble::assemble_events(buffer);
    assert_eq!(start_count, results.len());

    Ok(PipelineOutput {
        results,
        side_effects,
    })
}
