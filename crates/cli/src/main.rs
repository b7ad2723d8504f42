use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_apply::{parse_manifest, Applier, FileManifestLoader};
use keel_core::ObjectStore;
use keel_kubehub::{get_kube_client, KubeStore};
use keel_runtime::{ControllerConfig, Manager};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel declarative reconciliation engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict controllers to one namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers against the current cluster until ctrl-c
    Run {
        /// Workers per controller
        #[arg(long, env = "KEEL_WORKERS")]
        workers: Option<usize>,
        /// Re-enqueue every known object this often
        #[arg(long = "resync-secs", env = "KEEL_RESYNC_SECS")]
        resync_secs: Option<u64>,
        /// Delete children through a finalizer instead of the cluster garbage collector
        #[arg(long = "explicit-cascade", action = ArgAction::SetTrue)]
        explicit_cascade: bool,
        /// Also run the bootstrap controller, reading manifests under this directory
        #[arg(long = "manifest-root")]
        manifest_root: Option<String>,
    },
    /// Parse and validate a manifest file, then print it
    Manifest {
        path: String,
    },
    /// List served resources and check that every registered kind is among them
    Discover,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn emit(output: Output, v: &serde_json::Value) -> Result<()> {
    match output {
        Output::Json | Output::Human => println!("{}", serde_json::to_string_pretty(v)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(v)?),
    }
    Ok(())
}

async fn run(
    namespace: Option<String>,
    workers: Option<usize>,
    resync_secs: Option<u64>,
    explicit_cascade: bool,
    manifest_root: Option<String>,
) -> Result<()> {
    let mut config = ControllerConfig::from_env();
    if let Some(n) = workers {
        config = config.workers(n);
    }
    if let Some(s) = resync_secs {
        config = config.resync(Some(Duration::from_secs(s)).filter(|d| !d.is_zero()));
    }

    let registry = keel_operator::registry();
    let client = get_kube_client().await.context("connecting to the cluster")?;
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client, Arc::new(registry.clone())));
    let applier = Applier::new(store.clone(), Arc::new(registry.clone()));

    let mut messaging = keel_operator::messaging_controller(applier.clone(), explicit_cascade, config.clone());
    if let Some(ns) = namespace.as_deref() {
        messaging = messaging.namespace(ns);
    }
    let mut manager = Manager::new(store, registry).add(messaging);
    if let Some(root) = manifest_root {
        let loader = Arc::new(FileManifestLoader::new(&root));
        let mut bootstrap = keel_operator::bootstrap_controller(applier, loader, config.clone());
        if let Some(ns) = namespace.as_deref() {
            bootstrap = bootstrap.namespace(ns);
        }
        manager = manager.add(bootstrap);
        info!(root = %root, "bootstrap controller enabled");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received; shutting down"),
                Err(e) => warn!(error = %e, "cannot listen for ctrl-c; shutting down"),
            }
            shutdown.cancel();
        }
    });
    info!(workers = config.workers, ns = ?namespace, explicit_cascade, "keel starting");
    manager.run(shutdown).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { workers, resync_secs, explicit_cascade, manifest_root } => {
            if let Err(e) = run(cli.namespace, workers, resync_secs, explicit_cascade, manifest_root).await {
                error!(error = ?e, "run failed");
                return Err(e);
            }
        }
        Commands::Manifest { path } => {
            let text = tokio::fs::read_to_string(&path).await.with_context(|| format!("reading {}", path))?;
            let obj = parse_manifest(&text, cli.namespace.as_deref()).with_context(|| format!("parsing {}", path))?;
            let registry = keel_operator::registry();
            registry.validate(&obj).with_context(|| format!("validating {}", path))?;
            info!(key = %obj.key(), "manifest is valid");
            emit(cli.output, &obj.to_json())?;
        }
        Commands::Discover => {
            let client = get_kube_client().await.context("connecting to the cluster")?;
            let resources = keel_kubehub::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in &resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                _ => emit(cli.output, &serde_json::to_value(&resources)?)?,
            }
            let registry = keel_operator::registry();
            let missing = keel_kubehub::missing_kinds(&resources, &registry);
            if !missing.is_empty() {
                let keys: Vec<String> = missing.iter().map(|g| g.key()).collect();
                bail!("kinds not served by the cluster: {}", keys.join(", "));
            }
            info!(kinds = registry.kinds().count(), "all registered kinds are served");
        }
    }
    Ok(())
}
