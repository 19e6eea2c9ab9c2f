use common_types::{ClickHouseEvent, RawEvent};
use metrics::counter;
use tracing::debug;

use crate::{error::PipelineResult, metric_consts::EVENTS_DROPPED};

/// Account for every per-event outcome: enriched events pass through to be
/// emitted, drops hit the counter with their cause label, and the subset of
/// drops that warrant offline analysis yield their original payload for the
/// DLQ.
pub fn handle_outcomes(results: Vec<PipelineResult>) -> (Vec<ClickHouseEvent>, Vec<RawEvent>) {
    let mut to_emit = Vec::with_capacity(results.len());
    let mut to_dlq = Vec::new();

    for result in results {
        match result {
            Ok(event) => to_emit.push(event),
            Err(error) => {
                counter!(EVENTS_DROPPED, "cause" => error.drop_cause()).increment(1);
                debug!("dropping event: {error}");
                if let Some(raw) = error.dlq_payload() {
                    to_dlq.push(raw.clone());
                }
            }
        }
    }

    (to_emit, to_dlq)
}
