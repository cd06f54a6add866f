//! 'main' for the opentxs node process

use anyhow::Result;
use caryatid_process::Process;
use clap::Parser;
use config::{Config, Environment, File};
use opentxs_common::messages::Message;
use std::sync::Arc;
use tracing::info;

use opentxs_module_header_oracle::HeaderOracleModule;

use caryatid_module_spy::Spy;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, fmt, EnvFilter, Registry};

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["node.toml".to_string()])]
    config: Vec<String>,
}

/// Log events to stdout under `RUST_LOG`, and export spans over OTLP when
/// any `OTEL_*` variable is set.
fn init_tracing() -> Result<()> {
    let otel_layer = if std::env::vars().any(|(name, _)| name.starts_with("OTEL_")) {
        let exporter = SpanExporter::builder().with_tonic().build()?;
        let tracer = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .build()
            .tracer("opentxs-node");
        let span_filter =
            EnvFilter::from_default_env().add_directive(filter::LevelFilter::INFO.into());
        Some(
            OpenTelemetryLayer::new(tracer)
                .with_filter(span_filter)
                .with_filter(filter::filter_fn(|meta| meta.is_span())),
        )
    } else {
        None
    };

    Registry::default()
        .with(fmt::layer().with_filter(EnvFilter::from_default_env()))
        .with(otel_layer)
        .init();
    Ok(())
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing()?;

    info!("opentxs node process");

    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = Arc::new(builder.add_source(Environment::with_prefix("OPENTXS")).build()?);

    let mut process = Process::<Message>::create(config).await;

    HeaderOracleModule::register(&mut process);
    Spy::<Message>::register(&mut process);

    process.run().await?;

    info!("Exiting");

    Ok(())
}
