use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use etcd_pki_operator::clock::SystemClock;
use etcd_pki_operator::config::OperatorConfig;
use etcd_pki_operator::controller::{
    default_signer_targets, default_sync_rules, ControllerState, EventRecorder,
    KubeEventRecorder, KubeNodeTopology, KubeObjectStore, LogRecorder, Operator,
};
use etcd_pki_operator::pki::{create_combined_cert_key, CertRole};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the certificate rotation and resource sync controllers
    Run(RunArgs),
    /// Issue a node certificate offline from a CA certificate and key
    Issue(IssueArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// TOML configuration file
    #[arg(long, env = "ETCD_PKI_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace holding etcd and its certificates
    #[arg(long, env = "TARGET_NAMESPACE")]
    namespace: Option<String>,

    /// Namespace of the operator, where events are posted
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    operator_namespace: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum IssueRole {
    Peer,
    Server,
    Metrics,
}

impl From<IssueRole> for CertRole {
    fn from(role: IssueRole) -> Self {
        match role {
            IssueRole::Peer => CertRole::Peer,
            IssueRole::Server => CertRole::Server,
            IssueRole::Metrics => CertRole::MetricsServer,
        }
    }
}

#[derive(Parser, Debug)]
struct IssueArgs {
    #[arg(long, value_enum)]
    role: IssueRole,

    /// PEM CA certificate
    #[arg(long)]
    ca_cert: PathBuf,

    /// PEM CA private key
    #[arg(long)]
    ca_key: PathBuf,

    /// Node internal IP; repeat for each address
    #[arg(long = "ip", required = true)]
    ips: Vec<String>,

    #[arg(long)]
    cert_out: PathBuf,

    #[arg(long)]
    key_out: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("etcd-pki-operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Issue(issue_args) => {
            init_tracing(args.log_format);
            run_issue(issue_args)
        }
        Commands::Run(run_args) => {
            init_tracing(args.log_format);
            run_operator(run_args).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
    }
}

fn run_issue(args: IssueArgs) -> anyhow::Result<()> {
    let ca_cert = std::fs::read(&args.ca_cert)
        .with_context(|| format!("reading CA certificate {}", args.ca_cert.display()))?;
    let ca_key = std::fs::read(&args.ca_key)
        .with_context(|| format!("reading CA key {}", args.ca_key.display()))?;

    let role = CertRole::from(args.role);
    let (cert, key) =
        create_combined_cert_key(&ca_cert, &ca_key, role, &args.ips, chrono::Utc::now())
            .with_context(|| format!("issuing {role} certificate"))?;

    std::fs::write(&args.cert_out, cert)
        .with_context(|| format!("writing {}", args.cert_out.display()))?;
    std::fs::write(&args.key_out, key)
        .with_context(|| format!("writing {}", args.key_out.display()))?;

    info!(
        role = %role,
        cert = %args.cert_out.display(),
        key = %args.key_out.display(),
        "Issued certificate"
    );
    Ok(())
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    info!("Starting etcd-pki-operator v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => OperatorConfig::load(path)?,
        None => OperatorConfig::default(),
    };
    if let Some(namespace) = args.namespace {
        config.target_namespace = namespace;
    }
    if let Some(namespace) = args.operator_namespace {
        config.operator_namespace = namespace;
    }
    config.validate()?;

    let ciphers = config.etcd_cipher_suites();
    if !ciphers.is_empty() {
        info!(ciphers = %ciphers.join(","), "etcd cipher suites");
    }

    let client = kube::Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    info!("Connected to Kubernetes cluster");

    let recorder: Arc<dyn EventRecorder> = if config.record_events {
        Arc::new(KubeEventRecorder::new(
            client.clone(),
            config.operator_namespace.clone(),
        ))
    } else {
        Arc::new(LogRecorder)
    };
    let state = Arc::new(ControllerState {
        store: Arc::new(KubeObjectStore::new(client.clone())),
        topology: Arc::new(KubeNodeTopology::new(
            client,
            config.control_plane_selector.clone(),
        )),
        recorder,
        clock: Arc::new(SystemClock),
    });

    let operator = Operator::new(
        state,
        config.target_namespace.clone(),
        default_signer_targets(&config.target_namespace),
        default_sync_rules(&config),
        config.resync_interval(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    operator.run(shutdown_rx).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
