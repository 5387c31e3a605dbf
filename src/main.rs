//! CLI entry point: loads `AutoscalingOptions` from a YAML config file, wires up the
//! static loop against the bundled `StaticCloudProvider` demonstration double (spec 1
//! excludes any one real cloud's adapter), and drives it on a fixed-interval timer
//! until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use cluster_autoscaler::config::AutoscalingOptions;
use cluster_autoscaler::core::cloud_provider::{CloudProvider, Instance, StaticCloudProvider, StaticNodeGroup};
use cluster_autoscaler::core::common::{Resources, SystemClock};
use cluster_autoscaler::core::listers::{DaemonSet, InMemoryLister, PodDisruptionBudget};
use cluster_autoscaler::core::node::Node;
use cluster_autoscaler::core::pod::Pod;
use cluster_autoscaler::core::scale_down::actuator::NodeMutator;
use cluster_autoscaler::core::scale_up::{FirstFitExpander, ScaleUpOrchestrator};
use cluster_autoscaler::core::static_loop::StaticLoop;
use cluster_autoscaler::core::taints::TaintConfig;
use cluster_autoscaler::errors::{ActuationError, TaintError};

#[derive(Parser, Debug)]
#[command(name = "cluster-autoscaler", about = "Static autoscaling control loop")]
struct Cli {
    /// Path to a YAML AutoscalingOptions document. Missing keys fall back to defaults.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single tick and exit instead of looping on `scan_interval`.
    #[arg(long)]
    once: bool,
}

/// Logs every mutating call instead of touching a real API server, since this crate
/// defines no concrete cloud or cluster driver (spec 1). Swap this out for a real
/// Kubernetes client in a deployment that links this crate as a library.
struct LoggingNodeMutator;

impl NodeMutator for LoggingNodeMutator {
    fn taint_to_be_deleted(&self, node: &str, unix_time: u64) -> Result<(), TaintError> {
        info!("taint node {node} ToBeDeletedByClusterAutoscaler={unix_time}");
        Ok(())
    }

    fn cordon(&self, node: &str) {
        info!("cordon node {node}");
    }

    fn untaint_and_uncordon(&self, node: &str) {
        info!("untaint and uncordon node {node}");
    }

    fn evictable_pod_names(&self, _node: &str) -> Vec<String> {
        Vec::new()
    }

    fn evict_pod(&self, node: &str, pod: &str) -> Result<(), ActuationError> {
        info!("evict pod {pod} from node {node}");
        Ok(())
    }

    fn pod_gone(&self, _node: &str, _pod: &str) -> bool {
        true
    }

    fn owning_deployment(&self, _node: &str, _pod: &str) -> Option<(String, String)> {
        None
    }

    fn restart_deployment(&self, namespace: &str, name: &str) -> Result<(), ActuationError> {
        info!("restart deployment {namespace}/{name}");
        Ok(())
    }

    fn mark_deletion_candidate(&self, node: &str, unix_time: u64) {
        info!("taint node {node} DeletionCandidateOfClusterAutoscaler={unix_time}");
    }

    fn clean_deletion_candidate(&self, node: &str) {
        info!("clean DeletionCandidateOfClusterAutoscaler taint on node {node}");
    }
}

fn load_config(path: &PathBuf) -> AutoscalingOptions {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_yaml::from_str(&raw).unwrap_or_else(|e| {
            error!("failed to parse {}: {e}; using defaults", path.display());
            AutoscalingOptions::default()
        }),
        Err(e) => {
            info!("no config file at {} ({e}); using defaults", path.display());
            AutoscalingOptions::default()
        }
    }
}

/// Seeds a small demonstration provider: one elastic group, one atomic group. A real
/// deployment replaces this with its cloud's `CloudProvider` implementation.
fn demo_provider() -> Arc<StaticCloudProvider> {
    let provider = Arc::new(StaticCloudProvider::new());
    provider.add_group(
        StaticNodeGroup::new("workers", 1, 20, 2, Resources::new(4000, 16 * 1024 * 1024 * 1024))
            .with_instance(Instance::running("workers-1", cluster_autoscaler::core::common::Timestamp::zero()))
            .with_instance(Instance::running("workers-2", cluster_autoscaler::core::common::Timestamp::zero())),
    );
    provider.add_group(
        StaticNodeGroup::new("gpu-pool", 0, 3, 0, Resources::new(8000, 32 * 1024 * 1024 * 1024)).atomic(),
    );
    provider
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let options = load_config(&cli.config);

    let provider = demo_provider();
    let node_lister = Arc::new(InMemoryLister::<Node>::new(vec![
        Node::new("workers-1", Resources::new(4000, 16 * 1024 * 1024 * 1024)).with_label("node_group", "workers"),
        Node::new("workers-2", Resources::new(4000, 16 * 1024 * 1024 * 1024)).with_label("node_group", "workers"),
    ]));
    let pod_lister = Arc::new(InMemoryLister::<Pod>::new(Vec::new()));
    let pdb_lister = Arc::new(InMemoryLister::<PodDisruptionBudget>::new(Vec::new()));
    let daemonset_lister = Arc::new(InMemoryLister::<DaemonSet>::new(Vec::new()));
    let mutator = Arc::new(LoggingNodeMutator);
    let clock = Arc::new(SystemClock);
    let scale_up = ScaleUpOrchestrator::new(Arc::new(FirstFitExpander));

    let scan_interval = options.scan_interval;
    let static_loop = StaticLoop::new(
        provider as Arc<dyn CloudProvider>,
        node_lister,
        pod_lister,
        pdb_lister,
        daemonset_lister,
        mutator,
        clock,
        options,
        TaintConfig::default(),
        scale_up,
    );

    if cli.once {
        if let Err(e) = static_loop.tick() {
            error!("tick failed: {e}");
        }
        return;
    }

    let mut ticker = tokio::time::interval(scan_interval.max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = static_loop.tick() {
                    error!("tick failed: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, exiting");
                break;
            }
        }
    }
}
