//! Fence Settings
//!
//! The configuration surface exposed to the host, usually loaded from the
//! `fence:` section of the application YAML.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::FenceError;

pub const DEFAULT_LOG_TABLE_NAME: &str = "tcc_fence_log";

/// How stale fence rows are purged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanMode {
    /// Background task deletes old terminal rows every `clean_period_secs`
    Periodic,
    /// No background task; each successful Confirm/Cancel commit is
    /// followed by one cleanup batch of rows past `retention_secs`
    OnCommit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FenceSettings {
    pub clean_mode: CleanMode,
    /// Seconds between cleanup runs (PERIODIC only)
    pub clean_period_secs: u64,
    /// Terminal rows untouched for longer than this are deleted
    pub retention_secs: u64,
    /// Max rows per cleanup batch
    pub clean_batch_size: u32,
    /// Fence log table, optionally `schema.table`
    pub log_table_name: String,
}

impl Default for FenceSettings {
    fn default() -> Self {
        Self {
            clean_mode: CleanMode::Periodic,
            clean_period_secs: 86_400,
            retention_secs: 86_400,
            clean_batch_size: 1000,
            log_table_name: DEFAULT_LOG_TABLE_NAME.to_string(),
        }
    }
}

impl FenceSettings {
    pub fn clean_period(&self) -> Duration {
        Duration::from_secs(self.clean_period_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Terminal rows last modified before this instant may be deleted
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, FenceError> {
        let retention = chrono::Duration::from_std(self.retention())
            .map_err(|e| FenceError::InvalidConfig(format!("retention out of range: {}", e)))?;
        now.checked_sub_signed(retention)
            .ok_or_else(|| FenceError::InvalidConfig("retention out of range".to_string()))
    }

    pub fn validate(&self) -> Result<(), FenceError> {
        validate_table_name(&self.log_table_name)?;

        if self.clean_mode == CleanMode::Periodic && self.clean_period_secs == 0 {
            return Err(FenceError::InvalidConfig(
                "clean_period_secs must be greater than zero in PERIODIC mode".to_string(),
            ));
        }

        if self.clean_batch_size == 0 {
            return Err(FenceError::InvalidConfig(
                "clean_batch_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Check that a table name is safe to splice into SQL
///
/// Accepts `table` or `schema.table`, each segment `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_table_name(name: &str) -> Result<(), FenceError> {
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() > 2 {
        return Err(FenceError::InvalidConfig(format!(
            "log_table_name '{}' has too many segments",
            name
        )));
    }

    for segment in segments {
        let mut chars = segment.chars();
        let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
        if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(FenceError::InvalidConfig(format!(
                "log_table_name '{}' is not a valid SQL identifier",
                name
            )));
        }
    }

    Ok(())
}
