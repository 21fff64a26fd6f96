//! Concurrency planning for per-stream work
//!
//! Derives how many audio streams are measured or encoded at the same time
//! from the CPU core count and configuration.

use movie_normalizer_config::Config;

/// Upper bound for the derived worker count.
const MAX_DERIVED_WORKERS: u32 = 8;

/// Worker plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of streams processed concurrently
    pub max_parallel_streams: u32,
}

impl WorkerPlan {
    /// Derive a worker plan from configuration
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Uses `max_parallel_streams` unchanged when non-zero
    /// - Otherwise half the cores, at least 1 and at most 8
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .concurrency
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let max_parallel_streams = if cfg.concurrency.max_parallel_streams > 0 {
            cfg.concurrency.max_parallel_streams
        } else {
            derive_workers(total_cores)
        };

        Self {
            total_cores,
            max_parallel_streams,
        }
    }

    /// Worker count for a run over `audio_streams` streams.
    ///
    /// Never more workers than streams; at least one.
    pub fn workers_for(&self, audio_streams: usize) -> usize {
        (self.max_parallel_streams as usize).min(audio_streams).max(1)
    }
}

fn derive_workers(cores: u32) -> u32 {
    (cores / 2).clamp(1, MAX_DERIVED_WORKERS)
}
