//! Upload engine configuration
//!
//! [`UploadConfig`] carries every tunable of the upload pipeline. It can be
//! built in code (starting from [`Default`]), loaded from a JSON file, or
//! assembled by the CLI from arguments and environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Fraction of redundant sectors that may be missing before a segment is
/// considered in need of repair.
pub const DEFAULT_REPAIR_DOWNLOAD_THRESHOLD: f64 = 0.1;

/// Configuration for the upload engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Ceiling for bytes held by in-flight segments
    pub memory_limit_bytes: u64,

    /// Maximum number of segment lifecycle tasks running at once
    pub max_concurrent_segments: usize,

    /// Redundancy tolerance used for the download decision and for stuck
    /// determination
    pub repair_download_threshold: f64,

    /// Cooldown applied after the first consecutive upload failure of a host
    #[serde(deserialize_with = "deserialize_duration")]
    pub worker_base_cooldown: Duration,

    /// Upper bound for the exponential worker cooldown
    #[serde(deserialize_with = "deserialize_duration")]
    pub worker_max_cooldown: Duration,

    /// Consecutive failures after which the cooldown stops growing
    pub max_consecutive_failures: u32,

    /// Buffer size of the stuck-repair success channel
    pub stuck_success_capacity: usize,

    /// Seed for sector-to-worker assignment; random when absent
    pub rng_seed: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 256 * 1024 * 1024,
            max_concurrent_segments: 8,
            repair_download_threshold: DEFAULT_REPAIR_DOWNLOAD_THRESHOLD,
            worker_base_cooldown: Duration::from_secs(1),
            worker_max_cooldown: Duration::from_secs(60),
            max_consecutive_failures: 5,
            stuck_success_capacity: 64,
            rng_seed: None,
        }
    }
}

impl UploadConfig {
    /// Load a configuration from a JSON file, filling unspecified fields
    /// with defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_bytes == 0 {
            return Err(Error::Config(
                "memory_limit_bytes must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_segments == 0 {
            return Err(Error::Config(
                "max_concurrent_segments must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.repair_download_threshold) {
            return Err(Error::Config(format!(
                "repair_download_threshold must be in [0, 1), got {}",
                self.repair_download_threshold
            )));
        }
        if self.worker_max_cooldown < self.worker_base_cooldown {
            return Err(Error::Config(
                "worker_max_cooldown must not be shorter than worker_base_cooldown".to_string(),
            ));
        }
        if self.stuck_success_capacity == 0 {
            return Err(Error::Config(
                "stuck_success_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Cooldown for a host after `failures` consecutive upload failures
    pub fn cooldown_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.min(self.max_consecutive_failures).saturating_sub(1);
        let cooldown = self
            .worker_base_cooldown
            .saturating_mul(1u32 << exponent.min(31));
        cooldown.min(self.worker_max_cooldown)
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Parse a duration string like "500ms", "30s", "5m", "1h" or "1h30m".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if matches!(chars.peek(), Some('s') | Some('S')) => {
                chars.next();
                1
            }
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            'd' | 'D' => 86_400_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = add_component(total_ms, num, multiplier, s)?;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = add_component(total_ms, num, 1_000, s)?;
    }

    if total_ms == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_millis(total_ms))
}

fn add_component(total_ms: u64, num: u64, multiplier: u64, s: &str) -> Result<u64> {
    num.checked_mul(multiplier)
        .and_then(|ms| total_ms.checked_add(ms))
        .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))
}
