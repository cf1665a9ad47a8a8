use anyhow::Context as _;
use clap::{Parser, Subcommand};
use kanari::client::{read_plan, ClientError, ControlClient};
use kanari::config::{ControllerConfig, DEFAULT_SERVER};
use kanari::controller::cdevents::HttpEventSink;
use kanari::controller::clock::SystemClock;
use kanari::controller::prometheus::PrometheusClient;
use kanari::controller::reconciler::manifest::render_ingress_pair;
use kanari::controller::reconciler::KubeIngressApi;
use kanari::controller::{validate_plan, Context, Orchestrator};
use kanari::server::{
    create_metrics, run_server, shutdown_channel, wait_for_signal, ReadinessState, ServerState,
};
use kube::Client;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often terminal rollouts past their retention are pruned
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// How long in-flight HTTP requests get to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Canary rollouts for NGINX Ingress, gated on Prometheus metrics
#[derive(Debug, Parser)]
#[command(name = "kanari", version)]
pub struct Cli {
    /// Controller address used by the rollout verbs
    #[arg(long, env = "KANARI_SERVER", default_value = DEFAULT_SERVER, global = true)]
    pub server: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the controller (control API, health and metrics on KANARI_PORT)
    Serve,
    /// Start a rollout from a plan file (YAML or JSON)
    Start {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Freeze weight progression
    Pause { id: String },
    /// Continue a paused rollout, or retry activating a pending one
    Resume { id: String },
    /// Return all traffic to the stable revision
    Abort { id: String },
    /// Show one rollout, or all of them
    Status { id: Option<String> },
    /// Print the NGINX ingress pair for a plan file
    Render {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so command output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Cli { server, command } = Cli::parse();

    let result = match command {
        Command::Serve => {
            return match serve().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = format!("{e:#}"), "Controller failed");
                    ExitCode::FAILURE
                }
            };
        }
        Command::Render { file } => render(&file),
        verb => run_verb(&server, verb).await,
    };

    match result {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            exit_code(e.exit_code())
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Send one rollout verb to the controller and format its answer
async fn run_verb(server: &str, verb: Command) -> Result<String, ClientError> {
    let client = ControlClient::new(server);

    match verb {
        Command::Start { file } => {
            let plan = read_plan(&file)?;
            to_json(&client.start(&plan).await?)
        }
        Command::Pause { id } => to_json(&client.pause(&id).await?),
        Command::Resume { id } => to_json(&client.resume(&id).await?),
        Command::Abort { id } => to_json(&client.abort(&id).await?),
        Command::Status { id: Some(id) } => to_json(&client.status(&id).await?),
        Command::Status { id: None } => to_json(&client.list().await?),
        Command::Serve | Command::Render { .. } => {
            Err(ClientError::Other("not a controller verb".to_string()))
        }
    }
}

/// Validate a plan file and render its ingress pair
fn render(file: &std::path::Path) -> Result<String, ClientError> {
    let plan = read_plan(file)?;
    validate_plan(&plan).map_err(|e| ClientError::Plan {
        path: file.display().to_string(),
        reason: e.to_string(),
    })?;
    render_ingress_pair(&plan).map_err(|e| ClientError::Other(format!("render failed: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ClientError> {
    serde_json::to_string_pretty(value).map_err(|e| ClientError::Other(e.to_string()))
}

/// Run the controller until SIGTERM/SIGINT
async fn serve() -> anyhow::Result<()> {
    info!("Starting kanari canary rollout controller");

    let config = ControllerConfig::from_env();

    // Create shutdown channel for coordinated shutdown
    let (shutdown_controller, shutdown_signal) = shutdown_channel();

    // Create readiness state (initially not ready)
    let readiness = ReadinessState::new();

    let metrics = create_metrics().context("Failed to create metrics registry")?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let cdevents_sink = HttpEventSink::from_config(&config);
    info!(enabled = cdevents_sink.is_active(), "CDEvents sink configured");

    let prometheus_client =
        PrometheusClient::new(config.prometheus_address.clone(), config.prometheus_timeout);
    info!(address = %prometheus_client.address(), "Prometheus client configured");

    let port = config.port;
    let ctx = Arc::new(Context::new(
        Arc::new(KubeIngressApi::new(client)),
        Arc::new(prometheus_client),
        Arc::new(cdevents_sink),
        Arc::new(SystemClock),
        config,
        Some(metrics.clone()),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        ctx,
        shutdown_signal.token().child_token(),
    ));

    tokio::spawn(orchestrator.clone().run_janitor(JANITOR_INTERVAL));

    let state = ServerState::new(readiness.clone(), metrics, orchestrator.clone());
    let mut server = tokio::spawn(run_server(port, state, shutdown_signal.clone()));

    readiness.set_ready();
    info!(port = port, "Controller ready");

    tokio::select! {
        result = &mut server => {
            shutdown_controller.shutdown();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("Control API server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("Control API server task aborted")),
            };
        }
        signal = wait_for_signal() => {
            let signal = signal.context("Cannot register signal handlers")?;
            info!(signal = signal, "Initiating graceful shutdown");
            // Mark not ready so K8s stops sending traffic during shutdown
            readiness.set_not_ready();
        }
    }

    // Control loops stop at their next tick boundary, the server drains
    orchestrator.shutdown();
    shutdown_controller.shutdown();

    info!("Stopping components...");
    if tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
        warn!("Server did not drain before the shutdown deadline");
    }

    info!(
        unfinished = orchestrator
            .list()
            .await
            .iter()
            .filter(|s| !s.is_terminal())
            .count(),
        "kanari controller shut down"
    );
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
