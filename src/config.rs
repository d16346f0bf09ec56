//! certflow configuration loaded from `certflow.toml`.
//!
//! [`CertflowConfig`] holds every tunable. Fields missing from the file fall
//! back to defaults. `CERTFLOW_DATA_DIR` and `CERTFLOW_LOG` take precedence
//! over the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;

use crate::state_machine::State;

pub const CONFIG_FILE: &str = "certflow.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CertflowConfig {
    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub review: ReviewConfig,

    #[serde(default)]
    pub documents: DocumentConfig,

    #[serde(default)]
    pub outbox: OutboxConfig,

    #[serde(default)]
    pub expiry: ExpiryConfig,

    /// Directory holding one JSON record per application.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub json_logs: bool,
}

/// Flat fee per payment phase, in the smallest currency unit.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_phase_one_fee")]
    pub phase_one: u64,
    #[serde(default = "default_phase_two_fee")]
    pub phase_two: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewConfig {
    /// Failing reviews allowed before the documents are rejected outright.
    #[serde(default = "default_max_rejections")]
    pub max_rejections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    #[serde(default = "default_required_documents")]
    pub required: Vec<String>,
}

/// Outbox delivery policy.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Idle timeouts in days, keyed by state name. States without an entry
/// never expire.
#[derive(Debug, Clone, Deserialize)]
pub struct ExpiryConfig {
    #[serde(default = "default_idle_days")]
    pub idle_days: BTreeMap<String, u32>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".certflow")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_phase_one_fee() -> u64 {
    5000
}

fn default_phase_two_fee() -> u64 {
    25_000
}

fn default_max_rejections() -> u32 {
    2
}

fn default_required_documents() -> Vec<String> {
    [
        "id_card",
        "house_registration",
        "land_deed",
        "farm_map",
        "water_source_permit",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_batch_size() -> usize {
    64
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_idle_days() -> BTreeMap<String, u32> {
    [
        (State::Draft, 30),
        (State::PaymentPending1, 7),
        (State::PaymentPending2, 7),
        (State::DocumentRevision, 30),
    ]
    .into_iter()
    .map(|(state, days)| (state.to_string(), days))
    .collect()
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            phase_one: default_phase_one_fee(),
            phase_two: default_phase_two_fee(),
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_rejections: default_max_rejections(),
        }
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            required: default_required_documents(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            idle_days: default_idle_days(),
        }
    }
}

impl ExpiryConfig {
    /// Parsed idle timeouts. Unknown state names are an error so typos in the
    /// file do not silently disable expiry.
    pub fn timeouts(&self) -> Result<BTreeMap<State, Duration>> {
        self.idle_days
            .iter()
            .map(|(name, days)| {
                let state: State = name
                    .parse()
                    .map_err(|e| anyhow::anyhow!("expiry.idle_days: {e}"))?;
                Ok((state, Duration::days(i64::from(*days))))
            })
            .collect()
    }
}

impl Default for CertflowConfig {
    fn default() -> Self {
        Self {
            fees: FeeConfig::default(),
            review: ReviewConfig::default(),
            documents: DocumentConfig::default(),
            outbox: OutboxConfig::default(),
            expiry: ExpiryConfig::default(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl CertflowConfig {
    /// Load the config file at `path`, or defaults if it does not exist, then
    /// apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<CertflowConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        // Environment takes precedence over the file.
        if let Ok(dir) = std::env::var("CERTFLOW_DATA_DIR")
            && !dir.is_empty()
        {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("CERTFLOW_LOG")
            && !level.is_empty()
        {
            config.log_level = level;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = CertflowConfig::default();
        assert_eq!(config.fees.phase_one, 5000);
        assert_eq!(config.fees.phase_two, 25_000);
        assert_eq!(config.review.max_rejections, 2);
        assert_eq!(config.documents.required.len(), 5);
        assert_eq!(config.outbox.max_attempts, 5);
        assert_eq!(config.outbox.call_timeout_ms, 10_000);
        assert!(!config.json_logs);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            log_level = "debug"

            [fees]
            phase_two = 30000

            [outbox]
            max_attempts = 3
        "#;
        let config: CertflowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.fees.phase_one, 5000);
        assert_eq!(config.fees.phase_two, 30_000);
        assert_eq!(config.outbox.max_attempts, 3);
        assert_eq!(config.outbox.base_delay_ms, 1000);
        assert_eq!(config.review.max_rejections, 2);
    }

    #[test]
    fn expiry_timeouts_parse_state_names() {
        let timeouts = ExpiryConfig::default().timeouts().unwrap();
        assert_eq!(timeouts[&State::Draft], Duration::days(30));
        assert_eq!(timeouts[&State::PaymentPending2], Duration::days(7));
        assert!(!timeouts.contains_key(&State::DocumentReview));
    }

    #[test]
    fn unknown_expiry_state_is_an_error() {
        let config: CertflowConfig = toml::from_str(
            r#"
            [expiry.idle_days]
            SHIPPED = 3
        "#,
        )
        .unwrap();
        assert!(config.expiry.timeouts().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CertflowConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.outbox.batch_size, 64);
    }
}
