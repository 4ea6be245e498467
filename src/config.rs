//! Cache configuration.
//!
//! Controls the memory budget, the admission gate for concurrent network
//! loads, and atlas layout knobs for animated sequences.

use serde::Deserialize;

/// Hard ceiling on simultaneous network loads, regardless of configuration.
pub const CONCURRENT_LOADS_CEILING: usize = 20;

const DEFAULT_MAX_CACHE_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_MAX_CONCURRENT_LOADS: usize = 20;
const DEFAULT_MEMORY_CEILING_FRACTION: f64 = 0.3;
const DEFAULT_ATLAS_MAX_WIDTH: u32 = 1024;

/// How the byte budget is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    /// Use `max_cache_bytes` directly.
    Value,
    /// Use a fraction of `memory_ceiling_bytes` (a platform-reported memory
    /// ceiling supplied by the embedder). Falls back to `max_cache_bytes`
    /// when no ceiling is reported.
    Percent,
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Absolute byte budget, used in [`BudgetMode::Value`] and as the
    /// fallback for [`BudgetMode::Percent`].
    pub max_cache_bytes: u64,
    pub budget_mode: BudgetMode,
    /// Fraction of the reported ceiling to use in percent mode.
    /// Clamped to `0.01..=0.80` when applied.
    pub memory_ceiling_fraction: f64,
    /// Platform-reported memory ceiling in bytes; `0` means unreported.
    pub memory_ceiling_bytes: u64,
    /// Simultaneous network loads. Clamped to
    /// [`CONCURRENT_LOADS_CEILING`] and to at least 1.
    pub max_concurrent_loads: usize,
    /// Maximum atlas width in pixels for animated sequences.
    pub atlas_max_width: u32,
    /// Padding between atlas frames. Clamped to `0..=8` when applied.
    pub atlas_padding: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            budget_mode: BudgetMode::Value,
            memory_ceiling_fraction: DEFAULT_MEMORY_CEILING_FRACTION,
            memory_ceiling_bytes: 0,
            max_concurrent_loads: DEFAULT_MAX_CONCURRENT_LOADS,
            atlas_max_width: DEFAULT_ATLAS_MAX_WIDTH,
            atlas_padding: 0,
        }
    }
}

impl CacheConfig {
    /// Effective byte budget under the configured mode.
    pub fn max_budget_bytes(&self) -> u64 {
        match self.budget_mode {
            BudgetMode::Value => self.max_cache_bytes,
            BudgetMode::Percent => {
                if self.memory_ceiling_bytes == 0 {
                    return self.max_cache_bytes;
                }
                let fraction = self.memory_ceiling_fraction.clamp(0.01, 0.80);
                (self.memory_ceiling_bytes as f64 * fraction).floor() as u64
            }
        }
    }

    /// Admission gate size: configured value clamped to the hard ceiling.
    pub fn concurrent_loads(&self) -> usize {
        self.max_concurrent_loads.clamp(1, CONCURRENT_LOADS_CEILING)
    }

    pub fn atlas_padding_clamped(&self) -> u32 {
        self.atlas_padding.min(8)
    }
}
