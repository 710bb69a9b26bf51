use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use keel_apply::strip_noisy;
use keel_controller::{ControllerConfig, Hooks, Reconciler, Runner};
use keel_core::model::{Composition, CONDITION_SYNCED};
use keel_core::{ObjectKey, ObjectStore, RevisionStore, KIND_COMPONENT, KIND_COMPOSITION, OAM_API_VERSION};
use keel_kubehub::{watch_keys, KubeStore};
use keel_persist::SqliteRevisionStore;
use keel_render::StoreDefinitionLookup;
use keel_revision::{RevisionManager, StoreRevisionStore};
use keel_store::MemStore;
use rustc_hash::FxHashSet;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod manifest;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel application composition controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Yaml)]
    output: Output,

    /// Namespace to watch (run) or to default manifests into (render)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Yaml, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum RevisionBackend {
    /// apps/v1 ControllerRevision objects owned by each Component
    Objects,
    /// Local SQLite database (KEEL_DB_PATH)
    Sqlite,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile compositions in the current cluster until interrupted
    Run(RunArgs),
    /// Render compositions from a manifest file without a cluster
    Render {
        /// Multi-document YAML with Components, compositions and definitions
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Where component revision snapshots are kept
    #[arg(long = "revision-store", env = "KEEL_REVISION_STORE", value_enum, default_value_t = RevisionBackend::Objects)]
    revision_store: RevisionBackend,
    #[arg(long = "reconcile-timeout")]
    reconcile_timeout_secs: Option<u64>,
    #[arg(long = "short-wait")]
    short_wait_secs: Option<u64>,
    #[arg(long = "long-wait")]
    long_wait_secs: Option<u64>,
    #[arg(long = "depend-check-wait")]
    depend_check_wait_secs: Option<u64>,
    #[arg(long = "revision-limit")]
    revision_limit: Option<usize>,
    #[arg(long = "field-manager")]
    field_manager: Option<String>,
}

impl RunArgs {
    fn config(&self) -> ControllerConfig {
        let mut c = ControllerConfig::from_env();
        if let Some(v) = self.reconcile_timeout_secs { c.reconcile_timeout_secs = v; }
        if let Some(v) = self.short_wait_secs { c.short_wait_secs = v; }
        if let Some(v) = self.long_wait_secs { c.long_wait_secs = v; }
        if let Some(v) = self.depend_check_wait_secs { c.depend_check_wait_secs = v; }
        if let Some(v) = self.revision_limit { c.revision_limit = v; }
        if let Some(v) = &self.field_manager { c.field_manager = v.clone(); }
        c
    }
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
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

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(&args, cli.namespace).await,
        Commands::Render { file } => render(&file, cli.namespace.as_deref().unwrap_or("default"), cli.output).await,
    }
}

async fn run(args: &RunArgs, namespace: Option<String>) -> Result<()> {
    let config = args.config();
    info!(ns = ?namespace, revision_store = ?args.revision_store, ?config, "run invoked");
    let store = Arc::new(KubeStore::try_default(&config.field_manager).await.context("connecting to the cluster")?);
    let revisions: Arc<dyn RevisionStore> = match args.revision_store {
        RevisionBackend::Objects => Arc::new(StoreRevisionStore::new(store.clone())),
        RevisionBackend::Sqlite => Arc::new(SqliteRevisionStore::open_default()?),
    };
    let definitions = Arc::new(StoreDefinitionLookup::new(store.clone()));
    let manager = RevisionManager::new(store.clone(), revisions.clone(), config.revision_limit);
    let reconciler = Reconciler::new(store.clone(), revisions, definitions, Hooks::default(), config);

    let cap = std::env::var("KEEL_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048);
    let (comp_tx, comp_rx) = mpsc::channel::<ObjectKey>(cap);
    let (component_tx, component_rx) = mpsc::channel::<ObjectKey>(cap);
    for (kind, tx) in [(KIND_COMPOSITION, comp_tx), (KIND_COMPONENT, component_tx)] {
        let store = store.clone();
        let ns = namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_keys(&store, OAM_API_VERSION, kind, ns.as_deref(), tx).await {
                error!(%kind, error = ?e, "watcher failed");
            }
        });
    }

    let runner = Runner::new(store, reconciler, manager);
    runner
        .run(comp_rx, component_rx, async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn render(path: &Path, namespace: &str, output: Output) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let docs = manifest::parse(&text, namespace)?;
    let config = ControllerConfig::from_env();
    let store = Arc::new(MemStore::new());
    let revisions = Arc::new(StoreRevisionStore::new(store.clone()));

    let (mut compositions, mut components) = (Vec::new(), Vec::new());
    for doc in docs {
        let key = doc.key();
        store.create(doc).await.with_context(|| format!("loading {}", key))?;
        match key.kind.as_str() {
            KIND_COMPOSITION => compositions.push(key),
            KIND_COMPONENT => components.push(key),
            _ => {}
        }
    }
    let manager = RevisionManager::new(store.clone(), revisions.clone(), config.revision_limit);
    for key in &components {
        manager.on_component_changed(key).await?;
    }

    let definitions = Arc::new(StoreDefinitionLookup::new(store.clone()));
    let reconciler = Reconciler::new(store.clone(), revisions, definitions, Hooks::default(), config);
    let mut owners = FxHashSet::default();
    for key in &compositions {
        // a pass that only registers the scope finalizer asks to run again at once
        for _ in 0..2 {
            let res = reconciler.reconcile(key).await?;
            if res.requeue_after != Some(Duration::ZERO) { break; }
        }
        let comp: Composition = store.get(key).await?.decode()?;
        if let Some(c) = comp.status.condition(CONDITION_SYNCED).filter(|c| c.status != "True") {
            warn!(composition = %comp.name(), message = %c.message, "render failed");
        }
        for u in &comp.status.dependency.unsatisfied {
            warn!(composition = %comp.name(), from = %u.from.reference.name, to = %u.to.reference.name, reason = %u.reason, "dependency unsatisfied; object withheld");
        }
        owners.insert(comp.uid().to_string());
    }

    let snapshot = store.snapshot();
    let mut rendered: Vec<_> = snapshot.values().filter(|d| d.controller_uid().map(|u| owners.contains(&u)).unwrap_or(false)).collect();
    rendered.sort_by_key(|d| d.key());
    let bodies: Vec<serde_json::Value> = rendered.into_iter().map(|d| strip_noisy(d.as_json().clone())).collect();
    info!(compositions = compositions.len(), objects = bodies.len(), "render complete");
    match output {
        Output::Yaml => {
            for b in &bodies {
                print!("---\n{}", serde_yaml::to_string(b)?);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&bodies)?),
    }
    Ok(())
}
