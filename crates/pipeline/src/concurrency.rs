//! Concurrency planning for frame upscaling
//!
//! Derives how many upscaler processes may run at once from the core count
//! and configuration.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Concurrent upscaler invocations within one batch
    pub upscale_workers: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Uses an explicit non-zero `upscaler.workers` as-is
    /// - Otherwise derives half the cores, never fewer than one
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .upscaler
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32);

        let upscale_workers = if cfg.upscaler.workers > 0 {
            cfg.upscaler.workers
        } else {
            derive_workers(total_cores)
        };

        Self {
            total_cores,
            upscale_workers,
        }
    }
}

/// Half the cores, at least one
fn derive_workers(cores: u32) -> u32 {
    (cores / 2).max(1)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
