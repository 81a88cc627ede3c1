//! Derives per-worker launch parameters from the harness configuration.
//!
//! Each worker receives an even share of the aggregate request rate,
//! `total_rate / worker_count`. Shares are real-number divisions and need not
//! be integral. Capture file names are owned here so that the planner and the
//! [`crate::cleaner`] agree on the on-disk pattern.

use std::path::PathBuf;

use crate::config::Config;

/// File-name prefix shared by every capture file.
pub const CAPTURE_PREFIX: &str = "dump_";

/// File-name suffix shared by every capture file.
pub const CAPTURE_SUFFIX: &str = ".txt";

/// The capture file name for the worker at `index`.
#[must_use]
pub fn capture_file_name(index: u32) -> String {
    format!("{CAPTURE_PREFIX}{index}{CAPTURE_SUFFIX}")
}

/// Launch parameters for a single worker process.
///
/// Derived deterministically from [`Config`] and the worker's ordinal index.
/// Specs share nothing with one another beyond the parent configuration; in
/// particular each capture path is unique to its index.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    /// Ordinal of this worker, unique in `0..worker_count`.
    pub index: u32,
    /// This worker's portion of the aggregate rate, requests per second.
    pub rate_share: f64,
    /// Address of the cache server under load, `host:port`.
    pub target_addr: String,
    /// Seconds the worker ramps before steady-state measurement.
    pub warmup_seconds: u32,
    /// Worker-side measurement window parameter.
    pub window_size: u32,
    /// Where the worker's stdout report lands, when capture is enabled.
    pub capture_path: Option<PathBuf>,
}

/// Compute one [`WorkerSpec`] per worker
///
/// Produces exactly `worker_count` specs with indices `0..worker_count`. A
/// single-worker plan carries the entire rate.
#[must_use]
pub fn plan(config: &Config) -> Vec<WorkerSpec> {
    let count = config.worker_count.get();
    let rate_share = config.total_rate / f64::from(count);

    (0..count)
        .map(|index| WorkerSpec {
            index,
            rate_share,
            target_addr: config.target_addr.clone(),
            warmup_seconds: config.warmup_seconds,
            window_size: config.window_size,
            capture_path: config
                .capture
                .then(|| config.capture_directory.join(capture_file_name(index))),
        })
        .collect()
}
