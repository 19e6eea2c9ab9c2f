pub const ERRORS: &str = "ingester_errors";
pub const EVENTS_RECEIVED: &str = "ingester_events_received";
pub const EVENTS_PROCESSED: &str = "ingester_events_processed";
pub const EVENTS_WRITTEN: &str = "ingester_events_written";
pub const EVENTS_DROPPED: &str = "ingester_events_dropped";
pub const EVENTS_SENT_TO_DLQ: &str = "ingester_events_sent_to_dlq";
pub const EVENT_BATCH_SIZE: &str = "ingester_event_batch_size";
pub const BATCH_RETRIES: &str = "ingester_batch_retries";
pub const MAIN_LOOP_TIME: &str = "ingester_main_loop_time";
pub const HANDLE_BATCH_TIME: &str = "ingester_handle_batch_time";
pub const EMIT_EVENTS_TIME: &str = "ingester_emit_events_time";
pub const TEAM_LOOKUP_TIME: &str = "ingester_team_lookup_time";
pub const PREPARE_EVENTS_TIME: &str = "ingester_prepare_events_time";
pub const PERSON_PROCESSING_TIME: &str = "ingester_person_processing_time";
pub const GROUP_PROCESSING_TIME: &str = "ingester_group_processing_time";
pub const TRANSFORMATION_OUTCOME: &str = "ingester_transformation_outcome";
pub const INGESTION_WARNINGS_EMITTED: &str = "ingester_ingestion_warnings_emitted";
pub const HEATMAP_EVENTS_EMITTED: &str = "ingester_heatmap_events_emitted";
pub const PERSONS_CREATED: &str = "ingester_persons_created";
pub const PERSON_MERGES: &str = "ingester_person_merges";
pub const PERSON_UPDATE_RETRIES: &str = "ingester_person_update_retries";
pub const GROUP_TYPES_CAPPED: &str = "ingester_group_types_capped";
pub const GROUP_UPDATES_WRITTEN: &str = "ingester_group_updates_written";
pub const AI_EVENTS_ENRICHED: &str = "ingester_ai_events_enriched";
