//! workloadctl
//!
//! Runs a single workload operation against the current Kubernetes context.
//! CTRL+C or SIGTERM cancel the operation in flight.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use app_workload_reconciler::{
    adapters::{IngressRouteDirectory, KubeGateway, SecretBindingProvider},
    config::ReconcilerConfig,
    metrics,
    models::{NameSet, WorkloadRef},
    reconcilers::{Context, Workload},
};

#[derive(Parser, Debug)]
#[command(name = "workloadctl", about = "Reconcile application workloads")]
struct Cli {
    /// Namespace of the application
    #[arg(short, long, env = "WORKLOAD_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Application name
    app: String,

    /// Total attempts for conflicting writes [env: WORKLOAD_RETRY_STEPS]
    #[arg(long)]
    retry_steps: Option<u32>,

    /// Delay before the first retry, in milliseconds [env: WORKLOAD_RETRY_INITIAL_MS]
    #[arg(long)]
    retry_initial_ms: Option<u64>,

    /// Backoff multiplier between retries [env: WORKLOAD_RETRY_FACTOR]
    #[arg(long)]
    retry_factor: Option<f64>,

    /// Upper bound for a single retry delay, in milliseconds [env: WORKLOAD_RETRY_MAX_MS]
    #[arg(long)]
    retry_max_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[arg(short, long, value_enum, default_value_t = Output::Json)]
    output: Output,

    /// Print Prometheus metrics after the command
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the workload status
    Get,
    /// List the application's pods
    Pods,
    /// Set the number of instances
    Scale { instances: u32 },
    /// Trigger a rolling restart
    Restart,
    /// Wire the given variable names from the application's environment secret
    Env { names: Vec<String> },
    /// Change the bound services
    Bind {
        /// Services bound before this call
        #[arg(long, value_delimiter = ',')]
        old: Vec<String>,
        /// Services to bind
        #[arg(long = "service")]
        services: Vec<String>,
        /// User on whose behalf the bindings are resolved
        #[arg(long, env = "WORKLOAD_USER", default_value = "admin")]
        user: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Output {
    Json,
    Yaml,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(&cli)?;

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let context = Context::new(
        Arc::new(KubeGateway::new(client.clone())),
        Arc::new(SecretBindingProvider::new(client.clone(), &cli.namespace)),
        Arc::new(IngressRouteDirectory::new(client)),
        config,
    );

    let cancel = CancellationToken::new();
    let workload = Workload::new(context, WorkloadRef::new(&cli.app, &cli.namespace))
        .with_cancellation(cancel.clone());

    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Cancelling operation in flight");
            cancel.cancel();
        })
    };

    let result = run(&workload, &cli.command, cli.output).await;
    watcher.abort();

    if cli.print_metrics {
        print!("{}", metrics::render()?);
    }
    result
}

async fn run(workload: &Workload, command: &Command, output: Output) -> anyhow::Result<()> {
    match command {
        Command::Get => match workload.get().await? {
            Some(status) => print_value(&status, output)?,
            None => println!("{} is inactive", workload.workload_ref()),
        },
        Command::Pods => print_value(&workload.pod_names().await?, output)?,
        Command::Scale { instances } => workload.scale(*instances).await?,
        Command::Restart => workload.restart().await?,
        Command::Env { names } => workload.set_environment(names).await?,
        Command::Bind {
            old,
            services,
            user,
        } => {
            let old: NameSet = old.iter().filter(|s| !s.is_empty()).cloned().collect();
            workload.bind_services(user, &old, services).await?
        }
    }
    Ok(())
}

/// Defaults, then `WORKLOAD_RETRY_*` variables, then command-line flags
fn load_config(cli: &Cli) -> anyhow::Result<ReconcilerConfig> {
    let mut config = ReconcilerConfig::from_env()?;
    let retry = &mut config.retry;

    if let Some(steps) = cli.retry_steps {
        retry.steps = steps;
    }
    if let Some(ms) = cli.retry_initial_ms {
        retry.initial_delay = Duration::from_millis(ms);
    }
    if let Some(factor) = cli.retry_factor {
        retry.factor = factor;
    }
    if let Some(ms) = cli.retry_max_ms {
        retry.max_delay = Duration::from_millis(ms);
    }

    config.retry.validate()?;
    Ok(config)
}

fn print_value<T: serde::Serialize>(value: &T, output: Output) -> anyhow::Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_workload_reconciler=debug,kube=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
