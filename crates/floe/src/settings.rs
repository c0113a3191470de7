//! Queue table settings: parsing, defaults, normalization, and the
//! mode-dependent runtime mutability rules.
//!
//! Settings arrive as DDL-style name/value string pairs. Names may carry the
//! legacy `s3queue_` prefix for compatibility; normalization strips it during
//! parsing, never in storage.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Legacy compatibility prefix stripped from setting names.
pub const SETTINGS_PREFIX: &str = "s3queue_";

/// Processing mode of the queue table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Per-bucket path watermarks; paths processed in byte-lex order.
    Ordered,
    /// Tracked-file registry with TTL/cap eviction.
    Unordered,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueMode::Ordered => "ordered",
            QueueMode::Unordered => "unordered",
        }
    }

    fn parse(value: &str) -> Result<Self, QueueError> {
        match value.to_ascii_lowercase().as_str() {
            "ordered" => Ok(QueueMode::Ordered),
            "unordered" => Ok(QueueMode::Unordered),
            other => Err(QueueError::BadArguments {
                message: format!("Invalid `mode` value: {other} (expected Ordered/Unordered)"),
            }),
        }
    }
}

/// What to do with an object after it was successfully committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterProcessing {
    Keep,
    Delete,
}

impl AfterProcessing {
    pub fn as_str(&self) -> &'static str {
        match self {
            AfterProcessing::Keep => "keep",
            AfterProcessing::Delete => "delete",
        }
    }

    fn parse(value: &str) -> Result<Self, QueueError> {
        match value.to_ascii_lowercase().as_str() {
            "keep" => Ok(AfterProcessing::Keep),
            "delete" => Ok(AfterProcessing::Delete),
            other => Err(QueueError::BadArguments {
                message: format!("Invalid `after_processing` value: {other} (expected Keep/Delete)"),
            }),
        }
    }
}

/// Commit thresholds read by every worker of a cycle. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSettings {
    pub max_processed_files_before_commit: u64,
    pub max_processed_rows_before_commit: u64,
    pub max_processed_bytes_before_commit: u64,
    pub max_processing_time_sec_before_commit: u64,
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            max_processed_files_before_commit: 100,
            max_processed_rows_before_commit: 0,
            max_processed_bytes_before_commit: 0,
            max_processing_time_sec_before_commit: 0,
        }
    }
}

/// A single MODIFY SETTING change (normalized or not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    pub name: String,
    pub value: String,
}

impl SettingChange {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Full queue-table configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub mode: QueueMode,
    pub after_processing: AfterProcessing,
    pub keeper_path: Option<String>,
    pub loading_retries: u64,
    pub processing_threads_num: u64,
    pub tracked_file_ttl_sec: u64,
    pub tracked_files_limit: u64,
    pub cleanup_interval_min_ms: u32,
    pub cleanup_interval_max_ms: u32,
    pub polling_min_timeout_ms: u64,
    pub polling_max_timeout_ms: u64,
    pub polling_backoff_ms: u64,
    pub commit: CommitSettings,
    pub buckets: u64,
    pub list_objects_batch_size: u64,
    pub enable_hash_ring_filtering: bool,
    pub enable_logging_to_queue_log: u32,
    pub last_processed_path: String,
    pub reschedule_unregister_threshold_ms: u64,
    /// Whether `mode` was given explicitly (required on create).
    pub(crate) mode_set: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: QueueMode::Ordered,
            after_processing: AfterProcessing::Keep,
            keeper_path: None,
            loading_retries: 10,
            processing_threads_num: 1,
            tracked_file_ttl_sec: 0,
            tracked_files_limit: 1000,
            cleanup_interval_min_ms: 10_000,
            cleanup_interval_max_ms: 30_000,
            polling_min_timeout_ms: 1000,
            polling_max_timeout_ms: 10_000,
            polling_backoff_ms: 1000,
            commit: CommitSettings::default(),
            buckets: 0,
            list_objects_batch_size: 1000,
            enable_hash_ring_filtering: false,
            enable_logging_to_queue_log: 0,
            last_processed_path: String::new(),
            reschedule_unregister_threshold_ms: 5000,
            mode_set: false,
        }
    }
}

/// Strip the compatibility prefix from a setting name.
pub fn normalize_setting(name: &str) -> &str {
    name.strip_prefix(SETTINGS_PREFIX).unwrap_or(name)
}

/// Settings that may be altered at runtime in Unordered mode.
const CHANGEABLE_UNORDERED: &[&str] = &[
    "processing_threads_num",
    "loading_retries",
    "after_processing",
    "tracked_files_limit",
    "tracked_file_ttl_sec",
    "polling_min_timeout_ms",
    "polling_max_timeout_ms",
    "polling_backoff_ms",
    "max_processed_files_before_commit",
    "max_processed_rows_before_commit",
    "max_processed_bytes_before_commit",
    "max_processing_time_sec_before_commit",
    "enable_hash_ring_filtering",
    "list_objects_batch_size",
    "reschedule_unregister_threshold_ms",
];

/// Settings that may be altered at runtime in Ordered mode.
const CHANGEABLE_ORDERED: &[&str] = &[
    "loading_retries",
    "after_processing",
    "polling_min_timeout_ms",
    "polling_max_timeout_ms",
    "polling_backoff_ms",
    "max_processed_files_before_commit",
    "max_processed_rows_before_commit",
    "max_processed_bytes_before_commit",
    "max_processing_time_sec_before_commit",
    "buckets",
    "list_objects_batch_size",
    "reschedule_unregister_threshold_ms",
];

impl QueueSettings {
    /// Parse settings from DDL changes. Names are normalized; duplicates
    /// (including prefix/no-prefix duplicates) are rejected.
    pub fn from_changes(changes: &[SettingChange]) -> Result<Self, QueueError> {
        let mut settings = Self::default();
        let mut seen = HashSet::new();
        for change in changes {
            let name = normalize_setting(&change.name).to_string();
            if !seen.insert(name.clone()) {
                return Err(QueueError::BadArguments {
                    message: format!("Setting {name} is duplicated"),
                });
            }
            settings.apply(&name, &change.value)?;
        }
        Ok(settings)
    }

    /// Apply one normalized setting. Unknown names are rejected.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<(), QueueError> {
        match name {
            "mode" => {
                self.mode = QueueMode::parse(value)?;
                self.mode_set = true;
            }
            "after_processing" => self.after_processing = AfterProcessing::parse(value)?,
            "keeper_path" => {
                self.keeper_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "loading_retries" => self.loading_retries = parse_u64(name, value)?,
            "processing_threads_num" => self.processing_threads_num = parse_u64(name, value)?,
            "tracked_file_ttl_sec" => self.tracked_file_ttl_sec = parse_u64(name, value)?,
            "tracked_files_limit" => self.tracked_files_limit = parse_u64(name, value)?,
            "cleanup_interval_min_ms" => self.cleanup_interval_min_ms = parse_u32(name, value)?,
            "cleanup_interval_max_ms" => self.cleanup_interval_max_ms = parse_u32(name, value)?,
            "polling_min_timeout_ms" => self.polling_min_timeout_ms = parse_u64(name, value)?,
            "polling_max_timeout_ms" => self.polling_max_timeout_ms = parse_u64(name, value)?,
            "polling_backoff_ms" => self.polling_backoff_ms = parse_u64(name, value)?,
            "max_processed_files_before_commit" => {
                self.commit.max_processed_files_before_commit = parse_u64(name, value)?
            }
            "max_processed_rows_before_commit" => {
                self.commit.max_processed_rows_before_commit = parse_u64(name, value)?
            }
            "max_processed_bytes_before_commit" => {
                self.commit.max_processed_bytes_before_commit = parse_u64(name, value)?
            }
            "max_processing_time_sec_before_commit" => {
                self.commit.max_processing_time_sec_before_commit = parse_u64(name, value)?
            }
            "buckets" => self.buckets = parse_u64(name, value)?,
            "list_objects_batch_size" => self.list_objects_batch_size = parse_u64(name, value)?,
            "enable_hash_ring_filtering" => {
                self.enable_hash_ring_filtering = parse_bool(name, value)?
            }
            "enable_logging_to_queue_log" => {
                self.enable_logging_to_queue_log = parse_u32(name, value)?
            }
            "last_processed_path" => self.last_processed_path = value.to_string(),
            "reschedule_unregister_threshold_ms" => {
                self.reschedule_unregister_threshold_ms = parse_u64(name, value)?
            }
            other => {
                return Err(QueueError::BadArguments {
                    message: format!("Unknown queue setting: {other}"),
                })
            }
        }
        Ok(())
    }

    /// The default value of a setting, rendered the way `apply` accepts it.
    /// Used for RESET SETTING.
    pub fn default_value(name: &str) -> Result<String, QueueError> {
        let defaults = Self::default();
        Ok(match name {
            "mode" => defaults.mode.as_str().to_string(),
            "after_processing" => defaults.after_processing.as_str().to_string(),
            "keeper_path" => String::new(),
            "loading_retries" => defaults.loading_retries.to_string(),
            "processing_threads_num" => defaults.processing_threads_num.to_string(),
            "tracked_file_ttl_sec" => defaults.tracked_file_ttl_sec.to_string(),
            "tracked_files_limit" => defaults.tracked_files_limit.to_string(),
            "cleanup_interval_min_ms" => defaults.cleanup_interval_min_ms.to_string(),
            "cleanup_interval_max_ms" => defaults.cleanup_interval_max_ms.to_string(),
            "polling_min_timeout_ms" => defaults.polling_min_timeout_ms.to_string(),
            "polling_max_timeout_ms" => defaults.polling_max_timeout_ms.to_string(),
            "polling_backoff_ms" => defaults.polling_backoff_ms.to_string(),
            "max_processed_files_before_commit" => {
                defaults.commit.max_processed_files_before_commit.to_string()
            }
            "max_processed_rows_before_commit" => {
                defaults.commit.max_processed_rows_before_commit.to_string()
            }
            "max_processed_bytes_before_commit" => {
                defaults.commit.max_processed_bytes_before_commit.to_string()
            }
            "max_processing_time_sec_before_commit" => {
                defaults.commit.max_processing_time_sec_before_commit.to_string()
            }
            "buckets" => defaults.buckets.to_string(),
            "list_objects_batch_size" => defaults.list_objects_batch_size.to_string(),
            "enable_hash_ring_filtering" => defaults.enable_hash_ring_filtering.to_string(),
            "enable_logging_to_queue_log" => defaults.enable_logging_to_queue_log.to_string(),
            "last_processed_path" => String::new(),
            "reschedule_unregister_threshold_ms" => {
                defaults.reschedule_unregister_threshold_ms.to_string()
            }
            other => {
                return Err(QueueError::BadArguments {
                    message: format!("Unknown queue setting: {other}"),
                })
            }
        })
    }

    /// Validate create/attach-time constraints.
    pub fn validate(&self, is_attach: bool) -> Result<(), QueueError> {
        if !is_attach && !self.mode_set {
            return Err(QueueError::BadArguments {
                message: "Setting `mode` (Unordered/Ordered) is not specified, but is required"
                    .to_string(),
            });
        }
        if self.processing_threads_num == 0 {
            return Err(QueueError::BadArguments {
                message: "Setting `processing_threads_num` cannot be set to zero".to_string(),
            });
        }
        if self.cleanup_interval_min_ms > self.cleanup_interval_max_ms {
            return Err(QueueError::BadArguments {
                message: format!(
                    "Setting `cleanup_interval_min_ms` ({}) must be less or equal to `cleanup_interval_max_ms` ({})",
                    self.cleanup_interval_min_ms, self.cleanup_interval_max_ms
                ),
            });
        }
        Ok(())
    }

    /// Whether a (normalized) setting may change at runtime in the given mode.
    pub fn is_changeable(name: &str, mode: QueueMode) -> bool {
        let table = match mode {
            QueueMode::Unordered => CHANGEABLE_UNORDERED,
            QueueMode::Ordered => CHANGEABLE_ORDERED,
        };
        table.contains(&name)
    }

    /// Settings whose change requires zero attached dependent views.
    pub fn requires_detached_views(name: &str) -> bool {
        name == "buckets"
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64, QueueError> {
    value.parse().map_err(|_| QueueError::BadArguments {
        message: format!("Invalid value for setting {name}: {value}"),
    })
}

fn parse_u32(name: &str, value: &str) -> Result<u32, QueueError> {
    value.parse().map_err(|_| QueueError::BadArguments {
        message: format!("Invalid value for setting {name}: {value}"),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, QueueError> {
    match value {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        _ => Err(QueueError::BadArguments {
            message: format!("Invalid value for setting {name}: {value}"),
        }),
    }
}
