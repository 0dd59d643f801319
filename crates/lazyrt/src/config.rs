//! Runtime knobs for graph trimming and scalar handling.

use std::env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const TRIM_GRAPH_CHECK_FREQUENCY_VAR: &str = "LAZYRT_TRIM_GRAPH_CHECK_FREQUENCY";
const TRIM_GRAPH_SIZE_VAR: &str = "LAZYRT_TRIM_GRAPH_SIZE";
const HANDLE_SPECIAL_SCALARS_VAR: &str = "LAZYRT_HANDLE_SPECIAL_SCALARS";
const ALL_NUMBERS_SPECIAL_SCALARS_VAR: &str = "LAZYRT_ALL_NUMBERS_SPECIAL_SCALARS";

/// Settings consulted by every tensor bound to a [`LazyContext`](crate::LazyContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LazyConfig {
    /// How many trim-counter ticks pass between graph size checks.
    pub trim_graph_check_frequency: u64,
    /// Graph size (in unique nodes) above which a pending value is materialized.
    pub trim_graph_size: usize,
    /// Lower 0 and ±1 scalars to constant scalar nodes instead of device data.
    pub handle_special_scalars: bool,
    /// With `handle_special_scalars`, treat every numeric scalar as special.
    pub all_numbers_special_scalars: bool,
}

impl Default for LazyConfig {
    fn default() -> Self {
        LazyConfig {
            trim_graph_check_frequency: 5000,
            trim_graph_size: 100_000,
            handle_special_scalars: false,
            all_numbers_special_scalars: false,
        }
    }
}

impl LazyConfig {
    /// Defaults overridden by any `LAZYRT_*` environment variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = LazyConfig::default();
        if let Some(value) = read_var(TRIM_GRAPH_CHECK_FREQUENCY_VAR) {
            config.trim_graph_check_frequency = value
                .parse()
                .with_context(|| format!("invalid {TRIM_GRAPH_CHECK_FREQUENCY_VAR}={value}"))?;
        }
        if let Some(value) = read_var(TRIM_GRAPH_SIZE_VAR) {
            config.trim_graph_size = value
                .parse()
                .with_context(|| format!("invalid {TRIM_GRAPH_SIZE_VAR}={value}"))?;
        }
        if let Some(value) = read_var(HANDLE_SPECIAL_SCALARS_VAR) {
            config.handle_special_scalars = parse_bool(&value);
        }
        if let Some(value) = read_var(ALL_NUMBERS_SPECIAL_SCALARS_VAR) {
            config.all_numbers_special_scalars = parse_bool(&value);
        }
        Ok(config)
    }

    /// Whether a rank-0 value should become a scalar constant node.
    pub fn is_special_scalar(&self, value: f64) -> bool {
        if !self.handle_special_scalars {
            return false;
        }
        if self.all_numbers_special_scalars {
            return true;
        }
        value == 0.0 || value.abs() == 1.0
    }
}

fn read_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}
