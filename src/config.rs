// ⚙️ Engine Configuration - every tunable threshold in one place
// Loadable from a JSON file so deployments can tighten/loosen matching
// without a rebuild; defaults match the production values.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum similarity score for a business merge suggestion
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Days a rejected merge suggestion stays frozen before it may be
    /// re-suggested
    #[serde(default = "default_rejection_freeze_days")]
    pub rejection_freeze_days: i64,

    /// Projection horizon for open-ended subscriptions, in years
    #[serde(default = "default_projection_horizon_years")]
    pub projection_horizon_years: u32,

    /// How far a real bank charge may land from a projected subscription
    /// date and still complete it, in days
    #[serde(default = "default_subscription_date_tolerance_days")]
    pub subscription_date_tolerance_days: i64,

    /// Max ILS difference between a projected subscription amount and the
    /// real charge
    #[serde(default = "default_subscription_amount_tolerance")]
    pub subscription_amount_tolerance: f64,

    /// Minimum recurring occurrences before a subscription suggestion is
    /// raised
    #[serde(default = "default_min_recurrence_count")]
    pub min_recurrence_count: usize,
}

fn default_similarity_threshold() -> f64 {
    0.85
}

fn default_rejection_freeze_days() -> i64 {
    30
}

fn default_projection_horizon_years() -> u32 {
    3
}

fn default_subscription_date_tolerance_days() -> i64 {
    10
}

fn default_subscription_amount_tolerance() -> f64 {
    1.0
}

fn default_min_recurrence_count() -> usize {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            similarity_threshold: default_similarity_threshold(),
            rejection_freeze_days: default_rejection_freeze_days(),
            projection_horizon_years: default_projection_horizon_years(),
            subscription_date_tolerance_days: default_subscription_date_tolerance_days(),
            subscription_amount_tolerance: default_subscription_amount_tolerance(),
            min_recurrence_count: default_min_recurrence_count(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. Missing fields fall back to
    /// defaults; a missing file is an error (pass nothing and use
    /// `EngineConfig::default()` instead).
    pub fn load(path: &Path) -> Result<EngineConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        Ok(config)
    }
}
