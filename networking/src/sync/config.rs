//! Range sync configuration.
//!
//! Operational parameters for synchronization: batch sizes, retry limits and
//! chain concurrency. The constants are the defaults of [`SyncConfig`].

use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context as _, Result, ensure};
use containers::SLOTS_PER_EPOCH;
use serde::{Deserialize, Serialize};

/// The number of head syncing chains to sync at a time.
pub const PARALLEL_HEAD_CHAINS: usize = 2;

/// Minimum work a finalized chain must have over the current one before we
/// abandon the current chain's validated batches for it.
pub const MIN_FINALIZED_CHAIN_VALIDATED_EPOCHS: u64 = 10;

/// The number of times to retry a batch download before it is considered failed.
pub const MAX_BATCH_DOWNLOAD_ATTEMPTS: u8 = 5;

/// Consider a batch faulty after processing it this number of times.
pub const MAX_BATCH_PROCESSING_ATTEMPTS: u8 = 3;

/// Epochs covered by a single batch.
pub const EPOCHS_PER_BATCH: u64 = 2;

/// Maximum batches in flight (downloading, downloaded or processing) per chain.
pub const BATCH_BUFFER_SIZE: usize = 5;

/// Maximum concurrent block range requests to a single peer.
pub const MAX_CONCURRENT_REQUESTS: usize = 2;

/// Seconds during which the target of a failed chain is ignored.
pub const FAILED_CHAIN_TTL_SECS: u64 = 30;

/// Capacity of the channel feeding events into the sync service.
pub const SYNC_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub parallel_head_chains: usize,
    pub min_finalized_chain_validated_epochs: u64,
    pub max_batch_download_attempts: u8,
    pub max_batch_processing_attempts: u8,
    pub epochs_per_batch: u64,
    pub batch_buffer_size: usize,
    pub failed_chain_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallel_head_chains: PARALLEL_HEAD_CHAINS,
            min_finalized_chain_validated_epochs: MIN_FINALIZED_CHAIN_VALIDATED_EPOCHS,
            max_batch_download_attempts: MAX_BATCH_DOWNLOAD_ATTEMPTS,
            max_batch_processing_attempts: MAX_BATCH_PROCESSING_ATTEMPTS,
            epochs_per_batch: EPOCHS_PER_BATCH,
            batch_buffer_size: BATCH_BUFFER_SIZE,
            failed_chain_ttl_secs: FAILED_CHAIN_TTL_SECS,
        }
    }
}

impl SyncConfig {
    /// Load a config from a YAML file. Missing fields take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open sync config {}", path.display()))?;
        let config: Self = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse sync config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.parallel_head_chains > 0, "parallel_head_chains must be non-zero");
        ensure!(self.epochs_per_batch > 0, "epochs_per_batch must be non-zero");
        ensure!(self.batch_buffer_size > 0, "batch_buffer_size must be non-zero");
        ensure!(
            self.max_batch_download_attempts > 0,
            "max_batch_download_attempts must be non-zero"
        );
        ensure!(
            self.max_batch_processing_attempts > 0,
            "max_batch_processing_attempts must be non-zero"
        );
        Ok(())
    }

    /// Number of slots covered by a full batch.
    pub fn batch_size(&self) -> u64 {
        self.epochs_per_batch * SLOTS_PER_EPOCH
    }

    pub fn failed_chain_ttl(&self) -> Duration {
        Duration::from_secs(self.failed_chain_ttl_secs)
    }
}
