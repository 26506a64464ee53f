//! Engine configuration with TOML and environment variable support

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::lock::FILTERING_LOCK;

/// Tunables consumed by the orchestrator and its components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Items drained per viewport pass
    pub viewport_batch_size: usize,

    /// Items drained per background batch before yielding
    pub background_batch_size: usize,

    /// Minimum interval between two applied scroll events (milliseconds)
    pub scroll_debounce_ms: u64,

    /// Health check period (milliseconds)
    pub health_check_interval_ms: u64,

    /// Sessions older than this are force-completed (milliseconds)
    pub max_session_duration_ms: u64,

    /// Analysis cache capacity
    pub cache_max_size: usize,

    /// Analysis cache entry lifetime (milliseconds)
    pub cache_ttl_ms: u64,

    /// Maximum Hamming distance for two fingerprints to count as similar
    pub hamming_threshold: u32,

    /// Words per shingle
    pub shingle_size: usize,

    /// Normalised texts shorter than this are not fingerprinted
    pub min_text_length: usize,

    /// Deadline for the synchronous viewport pass (milliseconds)
    pub viewport_timeout_ms: u64,

    /// Distance around the viewport treated as near-viewport (pixels)
    pub near_viewport_margin_px: f64,

    /// Pause between background batches; 0 means a plain task yield
    pub background_yield_ms: u64,

    /// Cache sweep period (milliseconds)
    pub cache_sweep_interval_ms: u64,

    /// Continuous re-analysis tick while a session is active (milliseconds)
    pub continuous_analysis_interval_ms: u64,

    /// Bound on a single classifier call (milliseconds)
    pub analysis_timeout_ms: u64,

    /// Extra classifier attempts after a retryable failure
    pub classifier_max_retries: u32,

    /// Delay from the first buffered mutation to batch emission (milliseconds)
    pub mutation_throttle_ms: u64,

    /// Changes closer together than this extend the throttle window (milliseconds)
    pub mutation_burst_threshold_ms: u64,

    /// Buffer size at which the throttle window stops being extended
    pub mutation_max_buffer: usize,

    /// Hard ceiling on how long a buffered change may wait (milliseconds)
    pub mutation_max_delay_ms: u64,

    /// Descriptor text sent to the classifier is cut to this many characters
    pub descriptor_max_chars: usize,

    /// Entries kept per fingerprint set
    pub fingerprint_capacity: usize,

    /// Name of the session lock
    pub lock_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            viewport_batch_size: 20,
            background_batch_size: 10,
            scroll_debounce_ms: 100,
            health_check_interval_ms: 15_000,
            max_session_duration_ms: 300_000,
            cache_max_size: 100,
            cache_ttl_ms: 300_000,
            hamming_threshold: 15,
            shingle_size: 2,
            min_text_length: 10,
            viewport_timeout_ms: 200,
            near_viewport_margin_px: 800.0,
            background_yield_ms: 0,
            cache_sweep_interval_ms: 60_000,
            continuous_analysis_interval_ms: 2_000,
            analysis_timeout_ms: 10_000,
            classifier_max_retries: 1,
            mutation_throttle_ms: 300,
            mutation_burst_threshold_ms: 100,
            mutation_max_buffer: 50,
            mutation_max_delay_ms: 2_000,
            descriptor_max_chars: 500,
            fingerprint_capacity: 5_000,
            lock_name: FILTERING_LOCK.to_string(),
        }
    }
}

fn env_parse<T>(key: &str, slot: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {}: {}", key, e))?;
    }
    Ok(())
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;
        let config: EngineConfig =
            toml::from_str(&contents).map_err(|e| anyhow!("Failed to parse TOML config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PROGRESSIVE_*` environment overrides
    pub fn from_env(&mut self) -> Result<()> {
        env_parse("PROGRESSIVE_VIEWPORT_BATCH_SIZE", &mut self.viewport_batch_size)?;
        env_parse("PROGRESSIVE_BACKGROUND_BATCH_SIZE", &mut self.background_batch_size)?;
        env_parse("PROGRESSIVE_SCROLL_DEBOUNCE_MS", &mut self.scroll_debounce_ms)?;
        env_parse("PROGRESSIVE_HEALTH_CHECK_INTERVAL_MS", &mut self.health_check_interval_ms)?;
        env_parse("PROGRESSIVE_MAX_SESSION_DURATION_MS", &mut self.max_session_duration_ms)?;
        env_parse("PROGRESSIVE_CACHE_MAX_SIZE", &mut self.cache_max_size)?;
        env_parse("PROGRESSIVE_CACHE_TTL_MS", &mut self.cache_ttl_ms)?;
        env_parse("PROGRESSIVE_HAMMING_THRESHOLD", &mut self.hamming_threshold)?;
        env_parse("PROGRESSIVE_SHINGLE_SIZE", &mut self.shingle_size)?;
        env_parse("PROGRESSIVE_MIN_TEXT_LENGTH", &mut self.min_text_length)?;
        env_parse("PROGRESSIVE_VIEWPORT_TIMEOUT_MS", &mut self.viewport_timeout_ms)?;
        env_parse("PROGRESSIVE_ANALYSIS_TIMEOUT_MS", &mut self.analysis_timeout_ms)?;
        env_parse("PROGRESSIVE_MUTATION_THROTTLE_MS", &mut self.mutation_throttle_ms)?;

        if let Ok(name) = std::env::var("PROGRESSIVE_LOCK_NAME") {
            self.lock_name = name;
        }

        self.validate()
    }

    /// Defaults plus environment overrides
    pub fn with_env_overrides() -> Result<Self> {
        let mut config = Self::default();
        config.from_env()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.viewport_batch_size == 0 {
            return Err(anyhow!("viewport_batch_size must be > 0"));
        }
        if self.background_batch_size == 0 {
            return Err(anyhow!("background_batch_size must be > 0"));
        }
        if self.health_check_interval_ms == 0 {
            return Err(anyhow!("health_check_interval_ms must be > 0"));
        }
        if self.max_session_duration_ms == 0 {
            return Err(anyhow!("max_session_duration_ms must be > 0"));
        }
        if self.cache_max_size == 0 {
            return Err(anyhow!("cache_max_size must be > 0"));
        }
        if self.cache_ttl_ms == 0 {
            return Err(anyhow!("cache_ttl_ms must be > 0"));
        }
        if self.hamming_threshold > 64 {
            return Err(anyhow!("hamming_threshold must be in range [0, 64]"));
        }
        if self.shingle_size == 0 {
            return Err(anyhow!("shingle_size must be > 0"));
        }
        if self.viewport_timeout_ms == 0 {
            return Err(anyhow!("viewport_timeout_ms must be > 0"));
        }
        if !self.near_viewport_margin_px.is_finite() || self.near_viewport_margin_px < 0.0 {
            return Err(anyhow!("near_viewport_margin_px must be a non-negative number"));
        }
        if self.cache_sweep_interval_ms == 0 {
            return Err(anyhow!("cache_sweep_interval_ms must be > 0"));
        }
        if self.continuous_analysis_interval_ms == 0 {
            return Err(anyhow!("continuous_analysis_interval_ms must be > 0"));
        }
        if self.analysis_timeout_ms == 0 {
            return Err(anyhow!("analysis_timeout_ms must be > 0"));
        }
        if self.mutation_throttle_ms == 0 {
            return Err(anyhow!("mutation_throttle_ms must be > 0"));
        }
        if self.mutation_max_buffer == 0 {
            return Err(anyhow!("mutation_max_buffer must be > 0"));
        }
        if self.mutation_max_delay_ms < self.mutation_throttle_ms {
            return Err(anyhow!(
                "mutation_max_delay_ms must be >= mutation_throttle_ms"
            ));
        }
        if self.descriptor_max_chars == 0 {
            return Err(anyhow!("descriptor_max_chars must be > 0"));
        }
        if self.fingerprint_capacity == 0 {
            return Err(anyhow!("fingerprint_capacity must be > 0"));
        }
        if self.lock_name.trim().is_empty() {
            return Err(anyhow!("lock_name must not be empty"));
        }
        Ok(())
    }

    pub fn scroll_debounce(&self) -> Duration {
        Duration::from_millis(self.scroll_debounce_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn max_session_duration(&self) -> Duration {
        Duration::from_millis(self.max_session_duration_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn viewport_timeout(&self) -> Duration {
        Duration::from_millis(self.viewport_timeout_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    pub fn continuous_analysis_interval(&self) -> Duration {
        Duration::from_millis(self.continuous_analysis_interval_ms)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    pub fn background_yield(&self) -> Duration {
        Duration::from_millis(self.background_yield_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_name, "progressive_filtering");
        assert_eq!(config.hamming_threshold, 15);
        assert_eq!(config.shingle_size, 2);
    }

    #[test]
    fn test_invalid_batch_sizes() {
        let mut config = EngineConfig::default();
        config.viewport_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.background_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_hamming_threshold() {
        let mut config = EngineConfig::default();
        config.hamming_threshold = 65;
        assert!(config.validate().is_err());
        config.hamming_threshold = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mutation_ceiling_must_cover_throttle() {
        let mut config = EngineConfig::default();
        config.mutation_throttle_ms = 500;
        config.mutation_max_delay_ms = 400;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("cache_max_size = 7\nshingle_size = 3\n").unwrap();
        assert_eq!(config.cache_max_size, 7);
        assert_eq!(config.shingle_size, 3);
        assert_eq!(config.cache_ttl_ms, 300_000);
        assert!(config.validate().is_ok());
    }
}
