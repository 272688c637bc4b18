use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use appservice_operator::{controller, telemetry};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds between periodic re-reconciles of a healthy AppService
    #[arg(long, env = "RESYNC_SECONDS", default_value_t = 300)]
    resync_seconds: u64,

    /// Serve the admission webhook
    #[arg(long, env = "ENABLE_WEBHOOK")]
    enable_webhook: bool,

    /// Listen address of the admission webhook
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:8443")]
    webhook_addr: SocketAddr,

    /// TLS certificate (PEM) for the admission webhook
    #[arg(long, env = "WEBHOOK_TLS_CERT", requires = "webhook_key")]
    webhook_cert: Option<String>,

    /// TLS private key (PEM) for the admission webhook
    #[arg(long, env = "WEBHOOK_TLS_KEY", requires = "webhook_cert")]
    webhook_key: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("appservice-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn init_tracing(log_json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let json_layer = log_json.then(|| fmt::layer().json().with_target(true));
    let text_layer = (!log_json).then(|| fmt::layer().with_target(true));

    // Only enable OTEL if an endpoint is provided
    let otel_layer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => Some(telemetry::init_telemetry(&endpoint)?),
        Err(_) => None,
    };
    let otel_enabled = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    if otel_enabled {
        info!("OpenTelemetry tracing initialized");
    } else {
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_json)?;

    info!(
        "Starting AppService operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Initialize Kubernetes client
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    if args.enable_webhook {
        spawn_webhook(&args)?;
    }

    let state = Arc::new(controller::ControllerState::new(
        client,
        Duration::from_secs(args.resync_seconds),
    ));

    // Run the main controller loop
    let result = controller::run_controller(state, args.namespace.clone()).await;

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result.context("controller terminated with an error")
}

#[cfg(feature = "admission-webhook")]
fn spawn_webhook(args: &RunArgs) -> anyhow::Result<()> {
    use appservice_operator::webhook::WebhookServer;

    let mut server = WebhookServer::new();
    if let (Some(cert), Some(key)) = (&args.webhook_cert, &args.webhook_key) {
        server = server.with_tls(cert.clone(), key.clone());
    }

    let addr = args.webhook_addr;
    tokio::spawn(async move {
        if let Err(e) = server.start(addr).await {
            tracing::error!("Webhook server error: {:?}", e);
        }
    });
    Ok(())
}

#[cfg(not(feature = "admission-webhook"))]
fn spawn_webhook(_args: &RunArgs) -> anyhow::Result<()> {
    anyhow::bail!("--enable-webhook requires the `admission-webhook` feature")
}
