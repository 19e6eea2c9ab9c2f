use common_kafka::kafka_producer::KafkaProduceError;
use common_types::{ClickHouseEvent, RawEvent, TeamId};
use rdkafka::error::KafkaError;
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::PreparedEvent;

// An unhandled failure at some stage of the event pipeline, as well as the
// index of the item in the input buffer that caused the failure, so the
// consumer can retry the batch and eventually route the offending message
// to the DLQ.
#[derive(Debug)]
pub struct PipelineFailure {
    pub index: usize,
    pub error: UnhandledError,
}

impl From<(usize, UnhandledError)> for PipelineFailure {
    fn from((index, error): (usize, UnhandledError)) -> Self {
        PipelineFailure { index, error }
    }
}

// The result of running the pipeline against a single message. An error here
// indicates some expected/handled invalidity of the input, like a missing
// token or an unparseable uuid - the event is dropped and accounted for, not
// retried.
pub type PipelineResult = Result<ClickHouseEvent, EventError>;

// Mid-pipeline variant of the above, before the event has been assembled
// into its output shape.
pub type StageResult = Result<PreparedEvent, EventError>;

#[derive(Debug, Error)]
pub enum UnhandledError {
    #[error("Config error: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("Kafka error: {0}")]
    KafkaError(#[from] KafkaError),
    #[error("Produce error: {0}")]
    KafkaProduceError(#[from] KafkaProduceError),
    #[error("Sqlx error: {0}")]
    SqlxError(#[from] sqlx::Error),
    #[error("Unhandled serde error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Person update conflict for team {team_id}, distinct id {distinct_id}")]
    PersonUpdateConflict { team_id: TeamId, distinct_id: String },
    #[error("Unhandled error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Error)]
pub enum EventError {
    #[error("No team matched the event's token or team_id")]
    InvalidToken,
    #[error("Malformed event: {reason}")]
    Malformed {
        reason: String,
        // Kept whole so the consumer can route it to the DLQ for offline analysis
        event: Option<Box<RawEvent>>,
    },
    #[error("Invalid event uuid {raw:?} for team {team_id}")]
    InvalidUuid {
        team_id: TeamId,
        raw: String,
        event: Box<RawEvent>,
    },
    #[error("Event {0} dropped by a transformation")]
    TransformationDropped(Uuid),
    #[error("Cookieless event {0} filtered")]
    CookielessFiltered(Uuid),
    #[error("Event {event} not allowed when person processing is disabled ({uuid})")]
    RestrictedWhenPersonless { uuid: Uuid, event: String },
    #[error("Invalid heatmap data on event {0}")]
    InvalidHeatmapData(Uuid),
    #[error("Event {0} fully emitted to the heatmaps topic")]
    EmittedAsHeatmap(Uuid),
}

impl EventError {
    pub fn malformed(reason: impl ToString, event: Option<Box<RawEvent>>) -> Self {
        EventError::Malformed {
            reason: reason.to_string(),
            event,
        }
    }

    /// The label used on the drop counter for this error.
    pub fn drop_cause(&self) -> &'static str {
        match self {
            EventError::InvalidToken => "invalid_token",
            EventError::Malformed { .. } => "malformed",
            EventError::InvalidUuid { .. } => "invalid_event_uuid",
            EventError::TransformationDropped(_) => "transformation_dropped",
            EventError::CookielessFiltered(_) => "cookieless_filtered",
            EventError::RestrictedWhenPersonless { .. } => {
                "invalid_event_when_process_person_profile_is_false"
            }
            EventError::InvalidHeatmapData(_) => "invalid_heatmap_data",
            EventError::EmittedAsHeatmap(_) => "heatmap_fast_path",
        }
    }

    /// Benign drops never reach the DLQ. Undecodable input does, so it can
    /// be analyzed offline.
    pub fn do_not_send_to_dlq(&self) -> bool {
        !matches!(
            self,
            EventError::Malformed { event: Some(_), .. } | EventError::InvalidUuid { .. }
        )
    }

    /// The original message, for errors that route a copy to the DLQ.
    pub fn dlq_payload(&self) -> Option<&RawEvent> {
        if self.do_not_send_to_dlq() {
            return None;
        }
        match self {
            EventError::Malformed { event, .. } => event.as_deref(),
            EventError::InvalidUuid { event, .. } => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_causes_match_the_counter_taxonomy() {
        assert_eq!(EventError::InvalidToken.drop_cause(), "invalid_token");
        assert_eq!(
            EventError::RestrictedWhenPersonless {
                uuid: Uuid::nil(),
                event: "$identify".to_string()
            }
            .drop_cause(),
            "invalid_event_when_process_person_profile_is_false"
        );
    }

    #[test]
    fn restricted_personless_events_never_reach_the_dlq() {
        let err = EventError::RestrictedWhenPersonless {
            uuid: Uuid::nil(),
            event: "$identify".to_string(),
        };
        assert!(err.do_not_send_to_dlq());
        assert!(err.dlq_payload().is_none());
    }

    #[test]
    fn malformed_events_carry_their_payload_to_the_dlq() {
        let raw = RawEvent {
            event: "e".to_string(),
            ..Default::default()
        };
        let err = EventError::malformed("missing distinct_id", Some(Box::new(raw)));
        assert!(!err.do_not_send_to_dlq());
        assert_eq!(err.dlq_payload().unwrap().event, "e");
    }
}
