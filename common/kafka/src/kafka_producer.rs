use crate::config::KafkaConfig;

use futures::future::join_all;
use health::HealthHandle;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(liveness: HealthHandle) -> Self {
        Self { liveness }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext { liveness })?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("message rejected by the broker as too large")]
    MessageTooLarge,
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

impl KafkaProduceError {
    pub fn is_message_too_large(&self) -> bool {
        matches!(self, KafkaProduceError::MessageTooLarge)
    }
}

/// Hand a single serialized payload to the producer queue, returning the
/// delivery future to be awaited (with [`ack_delivery`]) once the rest of
/// the batch's work has been queued. Oversized payloads are classified at
/// enqueue time already, since librdkafka rejects them locally.
pub fn queue_to_kafka(
    kafka_producer: &FutureProducer<KafkaContext>,
    topic: &str,
    payload: &str,
    key: Option<&str>,
) -> Result<DeliveryFuture, KafkaProduceError> {
    match kafka_producer.send_result(FutureRecord {
        topic,
        payload: Some(payload),
        partition: None,
        key,
        timestamp: None,
        headers: None,
    }) {
        Ok(future) => Ok(future),
        Err((error, _)) => match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::MessageSizeTooLarge) => Err(KafkaProduceError::MessageTooLarge),
            _ => Err(KafkaProduceError::KafkaProduceError { error }),
        },
    }
}

/// Await a delivery future, classifying broker-side size rejections apart
/// from retryable produce failures.
pub async fn ack_delivery(future: DeliveryFuture) -> Result<(), KafkaProduceError> {
    match future.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
            Err(KafkaProduceError::MessageTooLarge)
        }
        Ok(Err((error, _))) => Err(KafkaProduceError::KafkaProduceError { error }),
        // Cancelled due to timeout while retrying
        Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
    }
}

pub async fn send_iter_to_kafka<T>(
    kafka_producer: &FutureProducer<KafkaContext>,
    topic: &str,
    iter: impl IntoIterator<Item = T>,
) -> Vec<Result<(), KafkaProduceError>>
where
    T: Serialize,
{
    send_keyed_iter_to_kafka(kafka_producer, topic, |_| None, iter).await
}

/// Queue every item, then await every delivery, returning one result per
/// item in input order.
pub async fn send_keyed_iter_to_kafka<T>(
    kafka_producer: &FutureProducer<KafkaContext>,
    topic: &str,
    key_extractor: impl Fn(&T) -> Option<String>,
    iter: impl IntoIterator<Item = T>,
) -> Vec<Result<(), KafkaProduceError>>
where
    T: Serialize,
{
    let mut results = Vec::new();
    let mut delivery_futures = Vec::new();

    for i in iter {
        let key = key_extractor(&i);
        let payload = match serde_json::to_string(&i) {
            Ok(p) => p,
            Err(e) => {
                results.push(Some(Err(KafkaProduceError::SerializationError { error: e })));
                continue;
            }
        };

        match queue_to_kafka(kafka_producer, topic, &payload, key.as_deref()) {
            Ok(future) => {
                results.push(None);
                delivery_futures.push(future);
            }
            Err(e) => results.push(Some(Err(e))),
        }
    }

    let mut acks = join_all(delivery_futures.into_iter().map(ack_delivery))
        .await
        .into_iter();

    results
        .into_iter()
        .map(|r| match r {
            Some(failed_at_enqueue) => failed_at_enqueue,
            None => acks.next().expect("one ack per queued delivery"),
        })
        .collect()
}
