use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use kafka_consumer::{Config, Message, Processor, ProcessorError, Runtime};

/// Logs every message it is handed. Stands in for real business logic.
struct LoggingProcessor;

#[async_trait]
impl Processor for LoggingProcessor {
    async fn process(
        &self,
        _cancel: &CancellationToken,
        message: &Message,
    ) -> Result<(), ProcessorError> {
        let value = message.value_as_str().map_err(ProcessorError::decode)?;
        debug!(
            messaging.destination.name = %message.topic,
            messaging.destination.partition.id = message.partition,
            messaging.kafka.offset = message.offset,
            "{value}"
        );
        Ok(())
    }
}

pub async fn index() -> &'static str {
    "kafka consumer"
}

fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    const BUCKETS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install prometheus recorder")
}

fn start_server(config: &Config, recorder: PrometheusHandle) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(move || ready(recorder.render())));

    let bind = config.bind_address();

    tokio::task::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "failed to bind metrics server on {bind}");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "metrics server failed");
        }
    })
}

fn init_tracer(sink_url: &str, service_name: &str) -> Result<Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
        .context("failed to install OTLP tracer")
}

async fn shutdown_signal() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = interrupt.recv() => info!("Received SIGINT"),
    };
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context(
        "Failed to load configuration from environment variables. Please check your environment setup.",
    )?;

    // Instantiate tracing outputs:
    //   - stdout with a level configured by the RUST_LOG envvar (default=INFO)
    //   - OpenTelemetry if an OTLP endpoint is configured
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    let otel_layer = config
        .otel_exporter_otlp_endpoint
        .as_deref()
        .map(|url| init_tracer(url, &config.otel_service_name))
        .transpose()?
        .map(OpenTelemetryLayer::new)
        .with_filter(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    info!("Starting kafka consumer");
    info!("Configuration loaded: {:?}", config);

    let recorder = setup_metrics_recorder()?;
    let server_handle = start_server(&config, recorder);
    info!("Started metrics server on {}", config.bind_address());

    let consumer_config = config.to_consumer_config(Arc::new(LoggingProcessor));
    let cancel = CancellationToken::new();
    let runtime = Runtime::connect(&consumer_config, cancel.clone())
        .context("Failed to create kafka consumer runtime. Check your Kafka configuration.")?;
    let mut runtime_handle = tokio::spawn(runtime.run());

    let result = tokio::select! {
        joined = &mut runtime_handle => Some(joined),
        signal = shutdown_signal() => {
            signal?;
            None
        }
    };

    let joined = match result {
        Some(joined) => joined,
        None => {
            info!("Shutting down, waiting up to {:?}", config.shutdown_timeout());
            cancel.cancel();
            match tokio::time::timeout(config.shutdown_timeout(), runtime_handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Runtime did not stop within the shutdown timeout");
                    server_handle.abort();
                    opentelemetry::global::shutdown_tracer_provider();
                    anyhow::bail!("shutdown timed out");
                }
            }
        }
    };

    server_handle.abort();
    opentelemetry::global::shutdown_tracer_provider();

    joined
        .context("kafka consumer runtime task failed")?
        .context("kafka consumer runtime stopped with an error")?;
    info!("Kafka consumer stopped");
    Ok(())
}
