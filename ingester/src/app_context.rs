use std::{sync::Arc, time::Duration};

use common_kafka::{
    kafka_consumer::SingleTopicConsumer,
    kafka_producer::{create_kafka_producer, KafkaContext},
};
use health::{HealthHandle, HealthRegistry};
use rdkafka::producer::FutureProducer;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    config::Config,
    error::UnhandledError,
    groups::{GroupTypeManager, PostgresGroupRepo},
    persons::PostgresPersonRepo,
    pipeline::{
        prep::PrepSettings,
        transform::{EventTransformer, PropertyFilterTransformer},
        PipelineContext,
    },
    teams::{PostgresTeamSource, TeamManager},
};

pub struct AppContext {
    pub health_registry: HealthRegistry,
    pub worker_liveness: HealthHandle,
    pub kafka_consumer: SingleTopicConsumer,
    pub producer: FutureProducer<KafkaContext>,
    pub pool: PgPool,
    pub pipeline: PipelineContext,
    pub config: Config,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, UnhandledError> {
        let health_registry = HealthRegistry::new("liveness");
        let worker_liveness = health_registry
            .register("worker".to_string(), Duration::from_secs(60))
            .await;

        let kafka_consumer =
            SingleTopicConsumer::new(config.kafka.clone(), config.consumer.clone())?;

        let producer_liveness = health_registry
            .register("kafka_producer".to_string(), Duration::from_secs(30))
            .await;
        let producer = create_kafka_producer(&config.kafka, producer_liveness).await?;

        let options = PgPoolOptions::new().max_connections(config.max_pg_connections);
        let pool = options.connect(&config.database_url).await?;

        let team_manager = Arc::new(TeamManager::new(
            config,
            Arc::new(PostgresTeamSource::new(pool.clone())),
        ));

        let transformers: Vec<Arc<dyn EventTransformer>> = vec![Arc::new(
            PropertyFilterTransformer::from_plugin_configs(&pool).await,
        )];

        let pipeline = PipelineContext {
            team_manager,
            person_repo: Arc::new(PostgresPersonRepo::new(pool.clone())),
            group_repo: Arc::new(PostgresGroupRepo::new(pool.clone())),
            group_type_manager: GroupTypeManager::new(config),
            transformers,
            settings: PrepSettings {
                timestamp_future_tolerance_ms: config.timestamp_future_tolerance_ms,
                skip_tokens: config.skip_tokens(),
            },
            person_resolution_retry_max: config.person_resolution_retry_max,
        };

        info!(
            "AppContext initialized, subscribed to topic {}",
            config.consumer.kafka_consumer_topic
        );

        Ok(Self {
            health_registry,
            worker_liveness,
            kafka_consumer,
            producer,
            pool,
            pipeline,
            config: config.clone(),
        })
    }
}
