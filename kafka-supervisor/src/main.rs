use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kafka_supervisor::config::{ConsumerConfig, MirrorConfig};
use kafka_supervisor::kafka::{create_kafka_producer, KafkaAsyncPublisher, KafkaGroupSession};
use kafka_supervisor::mirror::MirrorHandler;
use kafka_supervisor::server::{install_metrics_recorder, router, serve};
use kafka_supervisor::{AsyncProducer, ConsumerGroup, GroupError, MessageHandler};

const DEFAULT_LOG_FILTER: &str = "kafka_supervisor=info,kafka_mirror=info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        received = tokio::signal::ctrl_c() => {
            received?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting kafka mirror");

    ConsumerConfig::set_defaults("kafka-mirror", &["events"]);
    let config = MirrorConfig::init_from_env()
        .context("Failed to load configuration from environment variables")?;
    let deadline = Duration::from_secs(config.mirror_liveness_deadline_secs);

    let liveness = HealthRegistry::new("liveness");
    let metrics = install_metrics_recorder().context("Failed to install metrics recorder")?;
    let app = router(liveness.clone(), metrics);
    let bind = config.bind();
    let server = tokio::spawn(async move {
        if let Err(err) = serve(app, &bind).await {
            error!(err = %err, "failed to serve health and metrics");
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = wait_for_shutdown_signal().await {
                error!(err = %err, "failed to listen for shutdown signals");
            }
            shutdown.cancel();
        }
    });

    let producer_liveness = liveness
        .register("mirror-producer".to_string(), deadline)
        .await;
    let producer = create_kafka_producer(&config.kafka, producer_liveness)
        .await
        .context("Failed to create Kafka producer")?;
    let publisher = KafkaAsyncPublisher::new(producer, &config.kafka, &config.relay);
    let relay = Arc::new(AsyncProducer::new(publisher, &config.relay));
    info!(buffer_size = relay.buffer_size(), "relay started");

    let handler: Arc<dyn MessageHandler> = Arc::new(MirrorHandler::new(
        relay.clone(),
        config.mirror_target_topic.clone(),
    ));
    let consumer_liveness = liveness
        .register("mirror-consumer".to_string(), deadline)
        .await;

    let topics = config.consumer.topics();
    let outcome = loop {
        let session = match KafkaGroupSession::new(
            &config.kafka,
            &config.consumer,
            consumer_liveness.clone(),
        ) {
            Ok(session) => session,
            Err(err) => {
                break Err(anyhow::Error::new(err).context("Failed to create Kafka consumer"));
            }
        };
        let group = ConsumerGroup::new(
            session,
            config.consumer.kafka_consumer_group.clone(),
            topics.clone(),
        )
        .with_liveness(consumer_liveness.clone());

        match group.start(&shutdown, Some(handler.clone())).await {
            Ok(()) => break Ok(()),
            Err(GroupError::NeedsRecreation) if !shutdown.is_cancelled() => {
                warn!(
                    group = %group.group_id(),
                    failures = group.failures(),
                    "recreating consumer group"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(config.mirror_recreate_backoff_ms.0) => {}
                }
            }
            Err(GroupError::NeedsRecreation) => break Ok(()),
            Err(err) => {
                break Err(anyhow::Error::new(err).context("Consumer group stopped"));
            }
        }
    };

    // Drain the relay even when the group failed. The handler holds the
    // last other reference to it
    drop(handler);
    match Arc::try_unwrap(relay) {
        Ok(relay) => relay.close().await.context("Failed to drain relay")?,
        Err(_) => error!("relay still shared at shutdown, queued messages are lost"),
    }
    server.abort();

    outcome?;
    info!("kafka mirror stopped");
    Ok(())
}
