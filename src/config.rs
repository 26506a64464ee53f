//! Configuration module for the progressive filter demo host
//!
//! This module handles configuration loading from TOML files and environment
//! variables. Engine tunables live in [`EngineConfig`]; this layer adds the
//! logging switches and the simulated feed the demo binary drives.

use std::path::Path;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::engine::config::EngineConfig;
use crate::engine::matcher::Criteria;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine tunables
    #[serde(default)]
    pub engine: EngineConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Simulated feed for the demo driver
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Post texts laid out top to bottom
    #[serde(default = "default_posts")]
    pub posts: Vec<String>,

    /// Vertical distance between posts in pixels
    #[serde(default = "default_post_spacing")]
    pub post_spacing_px: f64,

    #[serde(default = "default_viewport_height")]
    pub viewport_height_px: f64,

    /// Simulated classifier round trip
    #[serde(default = "default_classifier_delay")]
    pub classifier_delay_ms: u64,

    /// Topics the simulated classifier filters
    #[serde(default = "default_classifier_topics")]
    pub classifier_topics: Vec<String>,

    /// Criteria the first session runs with
    #[serde(default = "default_criteria")]
    pub criteria: Criteria,

    /// Scroll events the driver emits
    #[serde(default = "default_scroll_steps")]
    pub scroll_steps: u32,

    #[serde(default = "default_scroll_step_px")]
    pub scroll_step_px: f64,

    /// Delay between scroll events
    #[serde(default = "default_scroll_interval")]
    pub scroll_interval_ms: u64,

    /// Stats log period while the driver runs
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

// Default value functions
fn default_log_level() -> String { "info".to_string() }
fn default_post_spacing() -> f64 { 180.0 }
fn default_viewport_height() -> f64 { 800.0 }
fn default_classifier_delay() -> u64 { 150 }
fn default_scroll_steps() -> u32 { 12 }
fn default_scroll_step_px() -> f64 { 240.0 }
fn default_scroll_interval() -> u64 { 120 }
fn default_stats_interval() -> u64 { 5 }

fn default_posts() -> Vec<String> {
    [
        "You won't BELIEVE what this celebrity did next, number 7 will shock you",
        "Local bakery shares its sourdough starter recipe with the neighbourhood",
        "Election night results are coming in from every district tonight",
        "You won't BELIEVE what this celebrity did next, number 8 will shock you",
        "Quarterly rust meetup: async traits, pinning and the borrow checker",
        "Official statement from the election commission on recount procedures",
        "Photos from the weekend hiking trip along the northern ridge",
        "Top 10 tricks doctors don't want you to know about sleep",
        "New library release adds streaming decompression support",
        "Election night results are coming in from every district tonight!",
        "Community garden is looking for volunteers this spring",
        "This one weird trick will double your savings overnight",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_classifier_topics() -> Vec<String> {
    vec!["election".to_string()]
}

fn default_criteria() -> Criteria {
    Criteria::new(["official"], ["won't believe", "weird trick", "top 10"])
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            posts: default_posts(),
            post_spacing_px: default_post_spacing(),
            viewport_height_px: default_viewport_height(),
            classifier_delay_ms: default_classifier_delay(),
            classifier_topics: default_classifier_topics(),
            criteria: default_criteria(),
            scroll_steps: default_scroll_steps(),
            scroll_step_px: default_scroll_step_px(),
            scroll_interval_ms: default_scroll_interval(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with `.env` and `PROGRESSIVE_*` overrides applied
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.engine.from_env()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;

        let sim = &self.simulation;
        if !(sim.post_spacing_px.is_finite() && sim.post_spacing_px > 0.0) {
            return Err(anyhow!("simulation.post_spacing_px must be > 0"));
        }
        if !(sim.viewport_height_px.is_finite() && sim.viewport_height_px > 0.0) {
            return Err(anyhow!("simulation.viewport_height_px must be > 0"));
        }
        if !sim.scroll_step_px.is_finite() {
            return Err(anyhow!("simulation.scroll_step_px must be a finite number"));
        }
        if sim.stats_interval_secs == 0 {
            return Err(anyhow!("simulation.stats_interval_secs must be > 0"));
        }
        Ok(())
    }
}
