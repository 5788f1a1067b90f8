use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub distributor: DistributorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where frames come from. Currently a directory of still images replayed
/// in file-name order; the timestamp embedded in each file name (if any)
/// becomes the frame's capture time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub directory: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Restart from the first file after the last one instead of ending.
    #[serde(default = "default_loop_forever")]
    pub loop_forever: bool,
    /// Pause between consecutive frames.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    /// Intensity cutoff used to binarize the frame delta (0-255).
    #[serde(default = "default_threshold")]
    pub threshold: u8,
    /// Exponential moving average weight for the running background.
    /// Must be in (0, 1]; higher adapts faster but absorbs moving objects.
    #[serde(default = "default_accumulate_alpha")]
    pub accumulate_alpha: f64,
    /// Erosion passes applied to the binarized mask to strip speckle noise.
    #[serde(default = "default_erode_iterations")]
    pub erode_iterations: u32,
    /// Gaussian blur kernel size (odd) applied before differencing.
    #[serde(default = "default_blur_size")]
    pub blur_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventConfig {
    /// A frame whose change ratio exceeds this is a motion hit.
    #[serde(default = "default_hit_threshold")]
    pub hit_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributorConfig {
    /// A consumer that leaves its readiness signal unconsumed this long is
    /// assumed gone and unregistered.
    #[serde(default = "default_dead_consumer_timeout_secs")]
    pub dead_consumer_timeout_secs: u64,
    /// Stop the producer worker after this long without any consumer
    /// activity. Absent means the worker runs until the process exits.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl DistributorConfig {
    pub fn dead_consumer_timeout(&self) -> Duration {
        Duration::from_secs(self.dead_consumer_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            accumulate_alpha: default_accumulate_alpha(),
            erode_iterations: default_erode_iterations(),
            blur_size: default_blur_size(),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            hit_threshold: default_hit_threshold(),
        }
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            dead_consumer_timeout_secs: default_dead_consumer_timeout_secs(),
            idle_timeout_secs: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            output_dir: default_output_dir(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks that serde alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detector.accumulate_alpha <= 0.0 || self.detector.accumulate_alpha > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "detector.accumulate_alpha must be in (0, 1], got {}",
                self.detector.accumulate_alpha
            )));
        }
        if self.detector.blur_size == 0 || self.detector.blur_size % 2 == 0 {
            return Err(ConfigError::Invalid(format!(
                "detector.blur_size must be odd and non-zero, got {}",
                self.detector.blur_size
            )));
        }
        if !(0.0..1.0).contains(&self.events.hit_threshold) {
            return Err(ConfigError::Invalid(format!(
                "events.hit_threshold must be in [0, 1), got {}",
                self.events.hit_threshold
            )));
        }
        if self.distributor.dead_consumer_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "distributor.dead_consumer_timeout_secs must be non-zero".into(),
            ));
        }
        if self.storage.jpeg_quality == 0 || self.storage.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "storage.jpeg_quality must be in 1..=100, got {}",
                self.storage.jpeg_quality
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_extensions() -> Vec<String> {
    vec!["jpg".into(), "jpeg".into()]
}
fn default_loop_forever() -> bool {
    true
}
fn default_frame_interval_ms() -> u64 {
    500
}
fn default_threshold() -> u8 {
    25
}
fn default_accumulate_alpha() -> f64 {
    0.2
}
fn default_erode_iterations() -> u32 {
    1
}
fn default_blur_size() -> u32 {
    3
}
fn default_hit_threshold() -> f64 {
    0.001
}
fn default_dead_consumer_timeout_secs() -> u64 {
    5
}
fn default_enabled() -> bool {
    true
}
fn default_output_dir() -> String {
    "output".into()
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_bind_addr() -> String {
    "0.0.0.0:8000".into()
}
fn default_log_level() -> String {
    "info".into()
}
