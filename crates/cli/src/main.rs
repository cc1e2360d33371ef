use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use blitz_kubehub::{ClusterCtl, KubeCluster, LabelDiscovery, DEFAULT_STATUS_PORT};
use blitz_neighborhood::{
    HttpStatusClient, NeighborhoodArgs, PassthroughArgs, RandomSelector, TaskArgsProvider,
};
use blitz_nuke::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "blitzctl", version, about = "Stateful-set nuke orchestrator")]
struct Cli {
    /// Kubernetes namespace holding the target stateful sets
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Repurpose stateful sets for a one-shot task, then restore them
    Nuke {
        /// Stateful set to nuke; repeat for several (explicit mode)
        #[arg(long = "name", action = ArgAction::Append)]
        names: Vec<String>,

        /// Label selector for discovery mode, e.g. "app=worker"
        #[arg(long = "selector")]
        selector: Option<String>,

        /// One token of the command the sets normally run; repeat per token
        #[arg(long = "restart-arg", action = ArgAction::Append)]
        restart_args: Vec<String>,

        /// One token of the one-shot task command; defaults to the restart command
        #[arg(long = "task-arg", action = ArgAction::Append)]
        task_args: Vec<String>,

        /// Image to set while restoring (default: keep the live image)
        #[arg(long = "image")]
        image: Option<String>,

        /// Aim each set's task at a randomly drawn neighborhood (discovery mode)
        #[arg(long = "random-neighborhood", action = ArgAction::SetTrue)]
        random_neighborhood: bool,

        /// Port of the node status endpoint used for targeting
        #[arg(long = "status-port", default_value_t = DEFAULT_STATUS_PORT)]
        status_port: u16,
    },
}

fn init_tracing() {
    let env = std::env::var("BLITZ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BLITZ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid BLITZ_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Nuke {
            names,
            selector,
            restart_args,
            task_args,
            image,
            random_neighborhood,
            status_port,
        } => {
            let namespace = cli.namespace.context("--ns is required")?;
            if restart_args.is_empty() {
                bail!("--restart-arg is required (the command the sets normally run)");
            }
            if names.is_empty() == selector.is_none() {
                bail!("pass exactly one of --name ... or --selector");
            }
            let task_args = if task_args.is_empty() { restart_args.clone() } else { task_args };

            let client = blitz_kubehub::get_kube_client().await?;
            let ctl: Arc<dyn ClusterCtl> = Arc::new(KubeCluster::new(client.clone()));

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Ctrl-C received; current target will still be restored");
                        cancel.cancel();
                    }
                });
            }

            let provider: Arc<dyn TaskArgsProvider> = if random_neighborhood {
                Arc::new(NeighborhoodArgs::new(HttpStatusClient::new(), RandomSelector::new()))
            } else {
                Arc::new(PassthroughArgs)
            };
            let mut orchestrator = Orchestrator::new(ctl, provider, namespace.as_str(), task_args);
            if let Some(image) = image {
                orchestrator = orchestrator.with_image_override(image);
            }

            let summary = match selector {
                Some(selector) => {
                    info!(selector = %selector, ns = %namespace, random_neighborhood, "nuke via discovery");
                    let discovery = LabelDiscovery::new(client, namespace.as_str(), selector)
                        .with_status_port(status_port);
                    orchestrator.run(&cancel, &discovery, &restart_args).await?
                }
                None => {
                    if random_neighborhood {
                        warn!("--random-neighborhood only applies with --selector; ignoring");
                    }
                    info!(count = names.len(), ns = %namespace, "nuke by name");
                    orchestrator.nuke_by_names(&cancel, &names, &restart_args).await?
                }
            };

            if summary.processed == 0 {
                bail!("no eligible stateful sets ({} skipped)", summary.skipped);
            }
            if summary.rollback_failures > 0 {
                warn!(
                    count = summary.rollback_failures,
                    "some restores failed; inspect the logs and the live specs"
                );
            }
            println!(
                "nuked {} stateful set(s); skipped {}; rollback failures {}",
                summary.processed, summary.skipped, summary.rollback_failures
            );
        }
    }

    Ok(())
}
