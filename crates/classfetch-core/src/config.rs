use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::limiter::LimiterConfig;

/// Scheduler loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Concurrency ceiling: jobs in flight at once.
    pub max_concurrent: usize,
    /// Transient-failure retries per job before offline divert.
    pub max_retries: u32,
    /// Wait between ceiling re-checks when all slots are busy.
    pub poll_interval_ms: u64,
    /// Base delay before retrying a transient failure; grows linearly
    /// with the attempt number.
    pub retry_delay_ms: u64,
    /// Age after which a non-terminal job is treated as orphaned.
    pub job_ttl_secs: u64,
    /// Age after which the current-operation marker is treated as stale.
    pub operation_ttl_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 3,
            poll_interval_ms: 250,
            retry_delay_ms: 1000,
            job_ttl_secs: 600,
            operation_ttl_secs: 600,
        }
    }
}

/// Rate limiter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSection {
    pub max_tokens: f64,
    /// Tokens per second.
    pub refill_rate: f64,
    pub initial_backoff_secs: f64,
    pub max_backoff_secs: u64,
}

impl Default for LimiterSection {
    fn default() -> Self {
        Self {
            max_tokens: 10.0,
            refill_rate: 1.0,
            initial_backoff_secs: 5.0,
            max_backoff_secs: 300,
        }
    }
}

impl LimiterSection {
    pub fn to_limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            max_tokens: self.max_tokens,
            refill_rate: self.refill_rate,
            initial_backoff: Duration::from_secs_f64(self.initial_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

/// Store-lock parameters. The timeout stays in single-digit seconds: it
/// bounds how long a crashed holder can stall everyone else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    pub timeout_secs: u64,
    pub retry_step_ms: u64,
    pub max_retries: u32,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            retry_step_ms: 150,
            max_retries: 10,
        }
    }
}

impl LockSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_step(&self) -> Duration {
        Duration::from_millis(self.retry_step_ms)
    }
}

/// Offline queue parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineSection {
    pub capacity: usize,
}

impl Default for OfflineSection {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

/// Global configuration loaded from `~/.config/classfetch/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassfetchConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub limiter: LimiterSection,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub offline: OfflineSection,
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("classfetch")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<ClassfetchConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = ClassfetchConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: ClassfetchConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = ClassfetchConfig::default();
        assert_eq!(cfg.scheduler.max_concurrent, 5);
        assert_eq!(cfg.scheduler.max_retries, 3);
        assert_eq!(cfg.limiter.max_tokens, 10.0);
        assert_eq!(cfg.lock.timeout_secs, 5);
        assert_eq!(cfg.offline.capacity, 50);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = ClassfetchConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ClassfetchConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.scheduler.max_concurrent, cfg.scheduler.max_concurrent);
        assert_eq!(parsed.limiter.refill_rate, cfg.limiter.refill_rate);
        assert_eq!(parsed.lock.retry_step_ms, cfg.lock.retry_step_ms);
    }

    #[test]
    fn config_toml_partial_sections_fall_back_to_defaults() {
        let toml = r#"
            [scheduler]
            max_concurrent = 2
            max_retries = 1
            poll_interval_ms = 50
            retry_delay_ms = 100
            job_ttl_secs = 120
            operation_ttl_secs = 120

            [limiter]
            max_tokens = 4.0
            refill_rate = 2.0
            initial_backoff_secs = 1.0
            max_backoff_secs = 30
        "#;
        let cfg: ClassfetchConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.scheduler.max_concurrent, 2);
        assert_eq!(cfg.limiter.max_tokens, 4.0);
        // Missing sections use defaults.
        assert_eq!(cfg.lock.timeout_secs, 5);
        assert_eq!(cfg.offline.capacity, 50);
    }

    #[test]
    fn limiter_section_converts_to_durations() {
        let section = LimiterSection {
            initial_backoff_secs: 0.5,
            max_backoff_secs: 20,
            ..LimiterSection::default()
        };
        let cfg = section.to_limiter_config();
        assert_eq!(cfg.initial_backoff, Duration::from_millis(500));
        assert_eq!(cfg.max_backoff, Duration::from_secs(20));
    }
}
