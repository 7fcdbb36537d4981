//! EngineConfig - エンジン全体の設定
//!
//! TOML から読み込める。省略したキーは `default_v1()` の値になる。
//!
//! ```toml
//! heartbeat_interval_secs = 30
//! crash_threshold_multiplier = 3
//! significant_fields = ["status", "current_phase", "iteration"]
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::SignificantFields;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Heartbeat renewal cadence.
    pub heartbeat_interval_secs: u64,

    /// A session is recovery-eligible once its heartbeat age is strictly
    /// greater than `heartbeat_interval_secs * crash_threshold_multiplier`.
    pub crash_threshold_multiplier: u32,

    /// Fields whose change creates a ContextVersion.
    pub significant_fields: SignificantFields,

    /// TTL of `task:` and `checkpoint:` mirror entries.
    pub cache_ttl_secs: u64,

    pub lock_ttl_secs: u64,

    /// How long an expired lock stays readable so the detector can flag it.
    pub stale_lock_retention_secs: u64,

    pub scan_workers: usize,

    /// Shared file count above which a file conflict is `high`.
    pub file_conflict_high_threshold: usize,

    pub version_divergence_window: usize,
    pub version_divergence_min_recoveries: usize,

    pub recent_action_limit: usize,
    pub session_action_capacity: usize,

    /// Re-read/merge attempts for updates without an explicit version token.
    pub update_retry_limit: u32,

    pub reaper_interval_secs: u64,
}

impl EngineConfig {
    pub fn default_v1() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            crash_threshold_multiplier: 3,
            significant_fields: SignificantFields::default_v1(),
            cache_ttl_secs: 24 * 60 * 60,
            lock_ttl_secs: 300,
            stale_lock_retention_secs: 3600,
            scan_workers: 4,
            file_conflict_high_threshold: 3,
            version_divergence_window: 5,
            version_divergence_min_recoveries: 2,
            recent_action_limit: 10,
            session_action_capacity: 50,
            update_retry_limit: 3,
            reaper_interval_secs: 30,
        }
    }

    /// Parse and validate. Missing keys fall back to `default_v1()`.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("crash_threshold_multiplier", u64::from(self.crash_threshold_multiplier)),
            ("lock_ttl_secs", self.lock_ttl_secs),
            ("scan_workers", self.scan_workers as u64),
            ("version_divergence_window", self.version_divergence_window as u64),
            (
                "version_divergence_min_recoveries",
                self.version_divergence_min_recoveries as u64,
            ),
            ("session_action_capacity", self.session_action_capacity as u64),
            ("update_retry_limit", u64::from(self.update_retry_limit)),
            ("reaper_interval_secs", self.reaper_interval_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.significant_fields.is_empty() {
            return Err(ConfigError::Invalid(
                "significant_fields must name at least one field".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat age beyond which a session counts as crashed.
    pub fn crash_threshold(&self) -> chrono::Duration {
        let secs = self
            .heartbeat_interval_secs
            .saturating_mul(u64::from(self.crash_threshold_multiplier));
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lock_ttl_secs).unwrap_or(i64::MAX))
    }

    /// Cache TTL for a lock entry: lease plus the window it stays visible once stale.
    pub fn lock_cache_ttl(&self) -> Duration {
        Duration::from_secs(
            self.lock_ttl_secs
                .saturating_add(self.stale_lock_retention_secs),
        )
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_v1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ContextField;

    #[test]
    fn defaults_match_v1() {
        let config = EngineConfig::default_v1();
        assert_eq!(config.crash_threshold(), chrono::Duration::seconds(90));
        assert_eq!(config.lock_cache_ttl(), Duration::from_secs(3900));
        assert_eq!(config.recent_action_limit, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            heartbeat_interval_secs = 10
            significant_fields = ["status", "score"]
            "#,
        )
        .unwrap();
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.crash_threshold(), chrono::Duration::seconds(30));
        assert!(config.significant_fields.contains(ContextField::Score));
        assert!(!config.significant_fields.contains(ContextField::Iteration));
        assert_eq!(config.scan_workers, 4);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = EngineConfig::from_toml_str("scan_workers = 0").unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid("scan_workers must be greater than zero".into())
        );
    }

    #[test]
    fn empty_significant_fields_is_rejected() {
        let err = EngineConfig::from_toml_str("significant_fields = []").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_field_name_fails_to_parse() {
        let err = EngineConfig::from_toml_str(r#"significant_fields = ["colour"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = EngineConfig::default_v1();
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
