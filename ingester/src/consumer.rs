use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common_kafka::{
    kafka_consumer::RecvErr,
    kafka_producer::{ack_delivery, queue_to_kafka, send_iter_to_kafka, KafkaProduceError},
};
use common_types::{ClickHouseEvent, RawEvent};
use metrics::{counter, histogram};
use rdkafka::producer::{DeliveryFuture, Producer};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    app_context::AppContext,
    metric_consts::{
        BATCH_RETRIES, EMIT_EVENTS_TIME, ERRORS, EVENTS_DROPPED, EVENTS_PROCESSED,
        EVENTS_RECEIVED, EVENTS_SENT_TO_DLQ, EVENTS_WRITTEN, EVENT_BATCH_SIZE,
        HANDLE_BATCH_TIME, INGESTION_WARNINGS_EMITTED, MAIN_LOOP_TIME,
    },
    pipeline::{errors::handle_outcomes, handle_batch, prep::warning, PipelineOutput, SideEffects},
};

pub async fn start_consumer(
    context: Arc<AppContext>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let config = &context.config;
    let batch_wait = Duration::from_secs(config.max_event_batch_wait_seconds);
    let batch_size = config.max_events_per_batch;

    loop {
        if *shutdown.borrow_and_update() {
            info!("Shutdown signal received, draining");
            break;
        }

        let whole_loop = common_metrics::timing_guard(MAIN_LOOP_TIME, &[]);
        context.worker_liveness.report_healthy().await;

        let received = context
            .kafka_consumer
            .json_recv_batch::<RawEvent>(batch_size, batch_wait)
            .await;

        let mut events = Vec::with_capacity(received.len());
        let mut offsets = Vec::with_capacity(received.len());

        for message in received {
            match message {
                Ok((event, offset)) => {
                    counter!(EVENTS_RECEIVED).increment(1);
                    events.push(event);
                    offsets.push(offset);
                }
                Err(RecvErr::Kafka(e)) => {
                    // Transient broker trouble - back off and let the next
                    // loop iteration retry the poll
                    counter!(ERRORS, "cause" => "recv_err").increment(1);
                    error!("Kafka error receiving message: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    break;
                }
                Err(err) => {
                    // Undecodable or empty payload: the consumer has already
                    // stored its offset, we just account for the drop
                    counter!(EVENTS_DROPPED, "cause" => "malformed").increment(1);
                    warn!("Received undecodable message: {err:?}");
                }
            }
        }

        if events.is_empty() {
            continue;
        }

        histogram!(EVENT_BATCH_SIZE).record(events.len() as f64);

        let handle_batch_time = common_metrics::timing_guard(HANDLE_BATCH_TIME, &[]);
        let output = process_with_retries(&context, events).await;
        handle_batch_time.label("outcome", "completed").fin();

        counter!(EVENTS_PROCESSED).increment(output.results.len() as u64);

        let emit_time = common_metrics::timing_guard(EMIT_EVENTS_TIME, &[]);
        emit_batch(&context, output).await;
        emit_time.label("outcome", "completed").fin();

        // Every completion has settled - the batch is done, so its offsets
        // are safe to store
        for offset in offsets {
            if let Err(e) = offset.store() {
                warn!("failed to store offset: {e:?}");
            }
        }

        whole_loop.label("finished", "true").fin();
    }

    // Drain: flush whatever the producer still holds, then commit the
    // stored offsets synchronously
    if let Err(e) = context
        .producer
        .flush(Duration::from_millis(config.drain_timeout_ms))
    {
        warn!("producer flush on shutdown failed: {e}");
    }
    if let Err(e) = context.kafka_consumer.commit_sync() {
        warn!("final offset commit failed: {e}");
    }
    info!("Consumer drained");
}

/// Run the batch through the pipeline, retrying on retryable failures.
/// Once a message has exhausted its retries it gets routed to the DLQ and
/// excised, and processing of the remainder continues.
async fn process_with_retries(context: &AppContext, mut events: Vec<RawEvent>) -> PipelineOutput {
    let retry_max = context.config.pipeline_retry_max;
    let mut attempts = 0;

    loop {
        if events.is_empty() {
            return PipelineOutput::default();
        }

        match handle_batch(events.clone(), &context.pipeline).await {
            Ok(output) => return output,
            Err(failure) => {
                attempts += 1;
                counter!(BATCH_RETRIES).increment(1);
                error!(
                    index = failure.index,
                    "batch processing failed, attempt {attempts}: {:?}", failure.error
                );

                if attempts >= retry_max {
                    let offending = events.remove(failure.index);
                    send_to_dlq(context, &offending).await;
                    attempts = 0;
                } else {
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempts))).await;
                }
            }
        }
    }
}

async fn send_to_dlq(context: &AppContext, event: &RawEvent) {
    counter!(EVENTS_SENT_TO_DLQ).increment(1);
    let results = send_iter_to_kafka(
        &context.producer,
        &context.config.dlq_topic,
        std::iter::once(event),
    )
    .await;
    for result in results {
        if let Err(e) = result {
            // Losing DLQ traffic silently would defeat its purpose
            error!("failed to produce to the DLQ: {e}");
            panic!("failed to produce to the DLQ: {e}");
        }
    }
}

/// Queue everything the batch produced, then await every delivery. Oversize
/// enriched events become a counted drop plus an ingestion warning; any
/// other produce failure means lost data, so we die and replay the batch
/// from the last committed offset.
async fn emit_batch(context: &AppContext, output: PipelineOutput) {
    let config = &context.config;
    let (to_emit, to_dlq) = handle_outcomes(output.results);
    let SideEffects {
        warnings,
        heatmaps,
        person_updates,
        group_updates,
    } = output.side_effects;

    counter!(INGESTION_WARNINGS_EMITTED).increment(warnings.len() as u64);

    // Warnings are fire-and-forget: operator visibility is not worth
    // failing ingestion over
    for result in send_iter_to_kafka(&context.producer, &config.ingestion_warnings_topic, &warnings)
        .await
    {
        if let Err(e) = result {
            warn!("failed to produce ingestion warning: {e}");
        }
    }

    for result in
        send_iter_to_kafka(&context.producer, &config.dlq_topic, &to_dlq).await
    {
        if let Err(e) = result {
            error!("failed to produce to the DLQ: {e}");
            panic!("failed to produce to the DLQ: {e}");
        }
    }
    counter!(EVENTS_SENT_TO_DLQ).increment(to_dlq.len() as u64);

    let mut pending = Vec::new();

    for (uuid, heatmap) in &heatmaps {
        let payload = serde_json::to_string(heatmap).expect("heatmap events are serializable");
        queue_or_panic(context, &config.heatmaps_topic, &payload, Some(uuid.to_string()), &mut pending);
    }
    for update in &person_updates {
        let payload = serde_json::to_string(update).expect("person updates are serializable");
        queue_or_panic(context, &config.persons_topic, &payload, Some(update.id.to_string()), &mut pending);
    }
    for update in &group_updates {
        let payload = serde_json::to_string(update).expect("group updates are serializable");
        queue_or_panic(context, &config.groups_topic, &payload, Some(update.group_key.clone()), &mut pending);
    }

    // Enriched events are queued one by one: they carry their routing
    // (exceptions without a sentry id go to symbolification instead of the
    // main topic), and an oversize payload only drops that one event
    let mut oversize_warnings = Vec::new();
    let mut delivery_meta = Vec::new();

    for event in &to_emit {
        let topic = if routes_to_exceptions(event) {
            &config.exceptions_topic
        } else {
            &config.enriched_events_topic
        };
        let payload = serde_json::to_string(event).expect("enriched events are serializable");
        let key = event.uuid.to_string();

        match queue_to_kafka(&context.producer, topic, &payload, Some(key.as_str())) {
            Ok(future) => {
                delivery_meta.push((event.uuid, event.team_id));
                pending.push(future);
            }
            Err(e) if e.is_message_too_large() => {
                oversize_warnings.push(oversize_warning(event));
            }
            Err(e) => {
                error!("failed to queue enriched event: {e}");
                panic!("failed to queue enriched event: {e}");
            }
        }
    }

    // The completion list: everything queued above settles before offsets
    // get stored
    let mut written = 0u64;
    let meta_offset = pending.len() - delivery_meta.len();
    let acks = futures::future::join_all(pending.into_iter().map(ack_delivery)).await;
    for (i, ack) in acks.into_iter().enumerate() {
        match ack {
            Ok(()) => written += 1,
            Err(KafkaProduceError::MessageTooLarge) => {
                // Only enriched events are big enough to hit this in
                // practice, and for them we know which one it was
                if let Some((uuid, team_id)) = i
                    .checked_sub(meta_offset)
                    .and_then(|idx| delivery_meta.get(idx))
                {
                    debug!(event_uuid = %uuid, "enriched event rejected as too large");
                    oversize_warnings.push(oversize_warning_for(*team_id, &uuid.to_string()));
                } else {
                    warn!("side-effect message rejected as too large");
                }
            }
            Err(e) => {
                error!("failed to produce batch output: {e}");
                panic!("failed to produce batch output: {e}");
            }
        }
    }

    counter!(EVENTS_WRITTEN).increment(written);
    counter!(EVENTS_DROPPED, "cause" => "message_size_too_large")
        .increment(oversize_warnings.len() as u64);

    for result in send_iter_to_kafka(
        &context.producer,
        &config.ingestion_warnings_topic,
        &oversize_warnings,
    )
    .await
    {
        if let Err(e) = result {
            warn!("failed to produce oversize warning: {e}");
        }
    }
}

fn queue_or_panic(
    context: &AppContext,
    topic: &str,
    payload: &str,
    key: Option<String>,
    pending: &mut Vec<DeliveryFuture>,
) {
    match queue_to_kafka(&context.producer, topic, payload, key.as_deref()) {
        Ok(future) => pending.push(future),
        Err(e) => {
            error!("failed to queue message for {topic}: {e}");
            panic!("failed to queue message for {topic}: {e}");
        }
    }
}

/// `$exception` events that haven't been through sentry get routed to the
/// symbolification topic in lieu of the main one.
fn routes_to_exceptions(event: &ClickHouseEvent) -> bool {
    if event.event != "$exception" {
        return false;
    }
    let Some(properties) = &event.properties else {
        return true;
    };
    match serde_json::from_str::<Value>(properties) {
        Ok(props) => props.get("$sentry_event_id").is_none(),
        Err(_) => true,
    }
}

fn oversize_warning(event: &ClickHouseEvent) -> common_kafka::kafka_messages::ingest_warning::IngestionWarning {
    oversize_warning_for(event.team_id, &event.uuid.to_string())
}

fn oversize_warning_for(
    team_id: i32,
    uuid: &str,
) -> common_kafka::kafka_messages::ingest_warning::IngestionWarning {
    warning(
        team_id,
        "message_size_too_large",
        HashMap::from([("eventUuid".to_string(), json!(uuid))]),
    )
}
