use anyhow::Context;
use clap::Parser;
use rdkafka::message::OwnedMessage;
use resilient_consumer::consumer::{
    create_stream_consumer, run_stream, ConsumerConfig, ConsumerMetrics, KafkaDlqPublisher,
    KafkaHandle, ResilientConsumer,
};
use resilient_consumer::envelope::{EnvelopeProcessor, LoggingHandler};
use resilient_consumer::telemetry::{init_logging, LogFormat};
#[cfg(feature = "telemetry")]
use resilient_consumer::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "resilient-consumer")]
#[command(about = "Consume JSON record envelopes with retry, DLQ and graceful drain", long_about = None)]
struct Cli {
    /// Bootstrap servers
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    brokers: String,

    /// Consumer group
    #[arg(long, env = "KAFKA_GROUP_ID", default_value = "resilient-consumer")]
    group_id: String,

    /// Topics to consume
    #[arg(long = "topic", env = "KAFKA_TOPICS", value_delimiter = ',', required = true)]
    topics: Vec<String>,

    /// Dead letter topic
    #[arg(long, env = "KAFKA_DLQ_TOPIC")]
    dlq_topic: String,

    /// YAML consumer config; `CONSUMER_*` environment variables are used otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Export spans to an OTLP collector configured through `OTEL_*` variables
    #[cfg(feature = "telemetry")]
    #[arg(long)]
    otlp: bool,
}

impl Cli {
    fn init_tracing(&self) -> anyhow::Result<()> {
        let format = if self.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        };

        #[cfg(feature = "telemetry")]
        {
            if self.otlp {
                return init_telemetry(TelemetryConfig::from_env(format)?);
            }
        }

        init_logging(format)
    }
}

type Processor = EnvelopeProcessor<OwnedMessage, LoggingHandler>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    cli.init_tracing()?;

    let config = match &cli.config {
        Some(path) => ConsumerConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConsumerConfig::from_env().context("reading CONSUMER_* environment")?,
    };

    let dlq = KafkaDlqPublisher::connect(&cli.brokers, cli.dlq_topic.clone())?;
    let stream_consumer = Arc::new(create_stream_consumer(
        &cli.brokers,
        &cli.group_id,
        &cli.topics,
    )?);
    let metrics = Arc::new(ConsumerMetrics::new());

    let consumer = Arc::new(
        ResilientConsumer::<Processor, KafkaHandle>::builder(
            config,
            Arc::new(EnvelopeProcessor::new(LoggingHandler)),
            Arc::new(dlq),
        )
        .metrics(metrics.clone())
        .build()?,
    );

    info!(
        topics = ?cli.topics,
        dlq_topic = %cli.dlq_topic,
        "Consuming"
    );

    let report = run_stream(consumer, stream_consumer, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    info!(
        timed_out = report.timed_out,
        inflight_remaining = report.inflight_remaining,
        "Stopped"
    );
    info!("Final metrics:\n{}", metrics.export_prometheus());

    #[cfg(feature = "telemetry")]
    {
        if cli.otlp {
            shutdown_telemetry();
        }
    }
    Ok(())
}
