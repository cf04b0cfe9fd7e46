use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tessera_component::{ReconcileOutcome, Reconciler};
use tessera_core::status::ComponentStatus;
use tessera_core::EngineConfig;
use tessera_kubehub::{ClusterKey, KubeStore, ObjectStore};
use tessera_store::KeyQueue;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tesseractl", version, about = "Tessera CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", env = "TESSERA_NAMESPACE", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconcile pass for a Cluster
    Reconcile {
        cluster: String,
    },
    /// Print the rolling-update stages of a component's pods
    Plan {
        cluster: String,
        #[arg(long = "component")]
        component: String,
    },
    /// Print the component statuses of a Cluster
    Status {
        cluster: String,
    },
    /// Watch Clusters and reconcile them until Ctrl-C
    Run {
        /// Interval between queue drains
        #[arg(long = "tick-ms", default_value_t = 500)]
        tick_ms: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("TESSERA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TESSERA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TESSERA_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let config = EngineConfig::from_env();
    let client = tessera_kubehub::get_kube_client().await.context("building kube client")?;
    let ns = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone(), config.manager_name.clone()));
    let reconciler = Reconciler::new(store.clone(), config.clone());

    match cli.command {
        Commands::Reconcile { cluster } => {
            let key = ClusterKey::new(ns, cluster);
            info!(cluster = %key, "reconcile invoked");
            let outcome = reconciler.reconcile(&key).await.with_context(|| format!("reconciling {}", key))?;
            match cli.output {
                Output::Human => print_outcome(&key, &outcome),
                Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
            }
        }
        Commands::Plan { cluster, component } => {
            let key = ClusterKey::new(ns, cluster);
            info!(cluster = %key, component = %component, "plan invoked");
            let stages = reconciler.update_plan(&key, &component).await.with_context(|| format!("planning {}/{}", key, component))?;
            match cli.output {
                Output::Human => {
                    if stages.is_empty() {
                        println!("(no pods)");
                    }
                    for (i, stage) in stages.iter().enumerate() {
                        println!("{:<3} {}", i + 1, stage.join(", "));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&stages)?),
            }
        }
        Commands::Status { cluster } => {
            let key = ClusterKey::new(ns, cluster);
            let found = store.get_cluster(&key.namespace, &key.name).await.with_context(|| format!("reading {}", key))?;
            let Some(found) = found else {
                eprintln!("cluster {} not found", key);
                return Ok(());
            };
            let status = found.status.unwrap_or_default();
            match cli.output {
                Output::Human => {
                    println!("CLUSTER {}  PHASE {}", key, phase_col(status.phase));
                    println!("COMPONENT        PHASE            READY  LEADER");
                    for (name, c) in status.components.iter() {
                        print_component(name, c);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&status)?),
            }
        }
        Commands::Run { tick_ms } => {
            run(client, cli.namespace, reconciler, Duration::from_millis(tick_ms.max(10))).await?;
        }
    }

    Ok(())
}

async fn run(client: kube::Client, namespace: Option<String>, reconciler: Reconciler, tick: Duration) -> Result<()> {
    let config = reconciler.config().clone();
    let (key_tx, mut key_rx) = mpsc::channel::<ClusterKey>(config.queue_cap);
    let watcher_handle = tokio::spawn({
        let tx = key_tx.clone();
        let manager = config.manager_name.clone();
        async move {
            if let Err(e) = tessera_kubehub::watch_all(client, namespace.as_deref(), &manager, tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });

    let mut queue = KeyQueue::with_capacity(config.queue_cap);
    let mut requeues = JoinSet::new();
    let mut ticker = tokio::time::interval(tick);
    info!(queue_cap = config.queue_cap, "controller loop started");
    loop {
        tokio::select! {
            maybe = key_rx.recv() => {
                match maybe {
                    Some(k) => queue.push(k),
                    None => {
                        warn!("key channel closed; exiting controller loop");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                for key in queue.drain_ready() {
                    match reconciler.reconcile(&key).await {
                        Ok(o) => {
                            if let Some(after) = o.requeue_after {
                                requeue_later(&mut requeues, key_tx.clone(), key, after);
                            }
                        }
                        Err(e) if e.is_transient() => requeue_later(&mut requeues, key_tx.clone(), key, config.requeue_after),
                        Err(e) => error!(cluster = %key, error = %e, "reconcile failed"),
                    }
                }
                while requeues.try_join_next().is_some() {}
                metrics::gauge!("queue_dropped", queue.dropped() as f64);
                metrics::gauge!("requeues_pending", requeues.len() as f64);
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down controller loop");
                break;
            }
        }
    }

    watcher_handle.abort();
    if !requeues.is_empty() {
        info!(requeues = requeues.len(), "dropping scheduled requeues");
    }
    requeues.shutdown().await;
    warn!(pending = queue.len(), "controller loop ended (graceful shutdown)");
    Ok(())
}

/// Send `key` back after `after`; the task lives in `set` so shutdown can cancel it.
fn requeue_later(set: &mut JoinSet<()>, tx: mpsc::Sender<ClusterKey>, key: ClusterKey, after: Duration) {
    set.spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send(key).await;
    });
}

fn phase_col(phase: Option<tessera_core::status::ComponentPhase>) -> String {
    phase.map(|p| format!("{:?}", p)).unwrap_or_else(|| "-".to_string())
}

fn print_outcome(key: &ClusterKey, o: &ReconcileOutcome) {
    println!("CLUSTER {}  PHASE {}", key, phase_col(o.phase));
    println!("COMPONENT        PHASE            CREATE UPDATE DELETE PODS-DELETED");
    for (name, c) in o.components.iter() {
        println!(
            "{:<16} {:<16} {:<6} {:<6} {:<6} {}",
            name,
            phase_col(c.phase),
            c.report.created,
            c.report.updated,
            c.report.deleted,
            c.pods_deleted
        );
    }
    if let Some(after) = o.requeue_after {
        println!("requeue after {}s", after.as_secs());
    }
}

fn print_component(name: &str, c: &ComponentStatus) {
    let ready = match c.pods_ready {
        Some(true) => "yes",
        Some(false) => "no",
        None => "-",
    };
    let leader = c.consensus_set_status.as_ref().map(|s| s.leader.pod.as_str()).unwrap_or("-");
    println!("{:<16} {:<16} {:<6} {}", name, phase_col(c.phase), ready, leader);
    for (k, msg) in c.message.iter() {
        println!("  {}: {}", k, msg);
    }
}
