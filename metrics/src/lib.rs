pub mod server;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics for the range sync engine.
///
/// Metrics are fire-and-forget: callers never depend on them for correctness.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    sync_state: IntGaugeVec,
    local_head_slot: IntGauge,
    local_finalized_epoch: IntGauge,
    sync_chains: IntGaugeVec,
    batch_downloads: IntCounterVec,
    batch_processing: IntCounterVec,
    chains_removed: IntCounterVec,
    batch_processing_time: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let peers = IntGauge::with_opts(Opts::new(
            "lean_sync_peers_connected",
            "Number of peers with a known status",
        ))?;
        registry.register(Box::new(peers.clone()))?;

        let sync_state = IntGaugeVec::new(
            Opts::new("lean_sync_state", "Current sync state (1 for the active state)"),
            &["state"],
        )?;
        registry.register(Box::new(sync_state.clone()))?;

        let local_head_slot = IntGauge::with_opts(Opts::new(
            "lean_sync_local_head_slot",
            "Slot of the local head",
        ))?;
        registry.register(Box::new(local_head_slot.clone()))?;

        let local_finalized_epoch = IntGauge::with_opts(Opts::new(
            "lean_sync_local_finalized_epoch",
            "Epoch of the local finalized checkpoint",
        ))?;
        registry.register(Box::new(local_finalized_epoch.clone()))?;

        let sync_chains = IntGaugeVec::new(
            Opts::new("lean_sync_chains", "Number of syncing chains"),
            &["kind"],
        )?;
        registry.register(Box::new(sync_chains.clone()))?;

        let batch_downloads = IntCounterVec::new(
            Opts::new("lean_sync_batch_downloads_total", "Batch download results"),
            &["result"],
        )?;
        registry.register(Box::new(batch_downloads.clone()))?;

        let batch_processing = IntCounterVec::new(
            Opts::new("lean_sync_batch_processing_total", "Batch processing results"),
            &["result"],
        )?;
        registry.register(Box::new(batch_processing.clone()))?;

        let chains_removed = IntCounterVec::new(
            Opts::new("lean_sync_chains_removed_total", "Syncing chains removed"),
            &["kind", "reason"],
        )?;
        registry.register(Box::new(chains_removed.clone()))?;

        let batch_processing_time = HistogramVec::new(
            HistogramOpts::new(
                "lean_sync_batch_processing_time_seconds",
                "Time taken to process a batch of blocks",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &[],
        )?;
        registry.register(Box::new(batch_processing_time.clone()))?;

        Ok(Self {
            registry,
            peers,
            sync_state,
            local_head_slot,
            local_finalized_epoch,
            sync_chains,
            batch_downloads,
            batch_processing,
            chains_removed,
            batch_processing_time,
        })
    }

    pub fn gather(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn set_peers(&self, v: i64) {
        self.peers.set(v);
    }

    /// Marks `state` as the active sync state and clears the others.
    pub fn set_sync_state(&self, state: &str, all_states: &[&str]) {
        for label in all_states {
            self.sync_state
                .with_label_values(&[*label])
                .set(i64::from(*label == state));
        }
    }

    pub fn set_local_head_slot(&self, v: i64) {
        self.local_head_slot.set(v);
    }

    pub fn set_local_finalized_epoch(&self, v: i64) {
        self.local_finalized_epoch.set(v);
    }

    pub fn set_sync_chains(&self, kind: &str, v: i64) {
        self.sync_chains.with_label_values(&[kind]).set(v);
    }

    pub fn inc_batch_download(&self, result: &str) {
        self.batch_downloads.with_label_values(&[result]).inc();
    }

    pub fn inc_batch_processing(&self, result: &str) {
        self.batch_processing.with_label_values(&[result]).inc();
    }

    pub fn inc_chain_removed(&self, kind: &str, reason: &str) {
        self.chains_removed.with_label_values(&[kind, reason]).inc();
    }

    pub fn observe_batch_processing_time(&self, duration: f64) {
        self.batch_processing_time
            .with_label_values::<&str>(&[])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_sync_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.set_peers(3);
        metrics.set_sync_state("synced", &["stalled", "synced"]);
        metrics.inc_batch_download("success");
        metrics.inc_chain_removed("head", "faulty");

        let text = metrics.gather().unwrap();
        assert!(text.contains("lean_sync_peers_connected 3"));
        assert!(text.contains("lean_sync_state{state=\"synced\"} 1"));
        assert!(text.contains("lean_sync_state{state=\"stalled\"} 0"));
        assert!(text.contains("lean_sync_batch_downloads_total{result=\"success\"} 1"));
    }
}
