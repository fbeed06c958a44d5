mod simulation;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail, ensure};
use clap::Parser;
use containers::Slot;
use libp2p_identity::PeerId;
use metrics::Metrics;
use metrics::server::{MetricsServerConfig, run_metrics_server};
use networking::sync::{ChainStore as _, SyncConfig, SyncMessage, SyncService};
use tokio::task;
use tracing::{info, warn};

use simulation::{
    SimulatedChain, SimulatedNetwork, SimulatedProcessor, SimulatedReporter, SimulatedStore,
};

/// Range sync against a simulated network.
#[derive(Parser, Debug)]
struct Args {
    /// YAML file with sync parameters
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Head slot of the simulated chain
    #[arg(long, default_value_t = 2_000)]
    head_slot: u64,

    /// Honest peers; each one lags a few slots behind the previous one
    #[arg(short, long, default_value_t = 4)]
    peers: usize,

    /// Peers serving blocks with broken parent links
    #[arg(long, default_value_t = 1)]
    faulty_peers: usize,

    /// Slots between the heads of consecutive honest peers
    #[arg(long, default_value_t = 3)]
    head_spread: u64,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    ensure!(args.peers > 0, "at least one honest peer is required");

    let config = match &args.config {
        Some(path) => SyncConfig::load_from_file(path)?,
        None => SyncConfig::default(),
    };
    info!(?config, "Loaded sync config");

    let chain = Arc::new(SimulatedChain::generate(args.head_slot));
    let network = Arc::new(SimulatedNetwork::new(chain.clone()));
    let store = Arc::new(SimulatedStore::new(&chain));
    let processor = Arc::new(SimulatedProcessor::new(store.clone()));
    let reporter = Arc::new(SimulatedReporter::default());

    let mut service = SyncService::new(config, network.clone(), processor, store.clone())
        .with_peer_reporter(reporter.clone());

    if let Some(metrics_port) = args.metrics_port {
        let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
        let server_config = MetricsServerConfig {
            metrics_address: args.metrics_address,
            metrics_port,
        };
        let server_metrics = metrics.clone();
        task::spawn(async move {
            if let Err(err) = run_metrics_server(server_config, server_metrics).await {
                warn!(error = %err, "Metrics server exited");
            }
        });
        service = service.with_metrics(metrics);
    }

    let status = service.status_handle();
    let sender = service.sender();
    let service_handle = task::spawn(service.run());

    let tip = Slot(args.head_slot);
    for index in 0..args.peers + args.faulty_peers {
        let peer_id = PeerId::random();
        let faulty = index >= args.peers;
        let head_slot = if faulty {
            tip
        } else {
            tip - args.head_spread * index as u64
        };

        network.add_peer(peer_id, head_slot, faulty);
        sender
            .send(SyncMessage::PeerConnected {
                peer_id,
                status: chain.status_at(head_slot),
            })
            .await
            .context("sync service stopped")?;
    }

    let progress = async {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let sync_status = status.status();
            info!(
                state = %sync_status.state,
                head_slot = sync_status.head_slot,
                sync_distance = sync_status.sync_distance,
                "Sync progress"
            );
            if sync_status.is_synced() {
                break;
            }
        }
    };

    let timed_out = tokio::time::timeout(Duration::from_secs(args.timeout_secs), progress)
        .await
        .is_err();

    sender
        .send(SyncMessage::Shutdown)
        .await
        .context("sync service stopped")?;
    service_handle.await??;

    for (peer_id, reports) in reporter.summary() {
        info!(peer = %peer_id, reports, "Peer reports");
    }

    if timed_out {
        bail!("not synced after {} seconds", args.timeout_secs);
    }

    let head = store.head();
    let finalized = store.finalized_checkpoint();
    info!(
        head_slot = head.slot.0,
        head_root = %head.root,
        finalized_epoch = finalized.epoch.0,
        "Simulation finished"
    );
    Ok(())
}
