//! Configuration record, resolved once at startup and passed by value into
//! every component constructor — no ambient globals (spec.md §9).
//!
//! Grounded on the teacher's `snafu`-based error style; the YAML document
//! itself follows the section layout of spec.md §6, parsed with `serde_yaml`
//! the way the pack's `datadog-library-config` crate parses its YAML
//! configuration into typed structs.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_listener_host() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}
fn default_listener_port() -> u16 {
    11112
}
fn default_ae_title() -> String {
    "NETRT".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_destination_port() -> u16 {
    104
}
fn default_working_dir() -> PathBuf {
    dirs_home_join("CNCT_working")
}
fn default_logs_dir() -> PathBuf {
    dirs_home_join("CNCT_logs")
}
fn default_quarantine_subdir() -> String {
    "quarantine".to_string()
}
fn default_debounce_seconds() -> u64 {
    5
}
fn default_min_file_count() -> usize {
    2
}
fn default_ignore_contour_names() -> Vec<String> {
    vec!["skull".to_string(), "patient_outline".to_string()]
}
fn default_overlay_series_number() -> i32 {
    9901
}
fn default_overlay_series_description() -> String {
    "RT Contour Overlay".to_string()
}
fn default_burn_in_text() -> String {
    "FOR RESEARCH USE ONLY - NOT FOR CLINICAL USE".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_app_log_file() -> String {
    "application.log".to_string()
}
fn default_transaction_log_file() -> String {
    "transactions.log".to_string()
}

fn dirs_home_join(leaf: &str) -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(leaf)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listener_host")]
    pub host: IpAddr,
    #[serde(default = "default_listener_port")]
    pub port: u16,
    #[serde(default = "default_ae_title")]
    pub ae_title: String,
    #[serde(default = "default_true")]
    pub config_negotiated_transfer_syntax: bool,
    /// Per-association inactivity timeout, seconds. Not in spec.md's option
    /// list but required by §4.B's inactivity-timeout invariant; defaulted
    /// conservatively.
    #[serde(default = "default_association_timeout")]
    pub association_timeout_seconds: u64,
    /// Per-instance size cap in bytes, required by §4.B.
    #[serde(default = "default_max_instance_bytes")]
    pub max_instance_bytes: u64,
}

fn default_association_timeout() -> u64 {
    60
}
fn default_max_instance_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            host: default_listener_host(),
            port: default_listener_port(),
            ae_title: default_ae_title(),
            config_negotiated_transfer_syntax: true,
            association_timeout_seconds: default_association_timeout(),
            max_instance_bytes: default_max_instance_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub ip: IpAddr,
    #[serde(default = "default_destination_port")]
    pub port: u16,
    pub ae_title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoriesConfig {
    #[serde(default = "default_working_dir")]
    pub working: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs: PathBuf,
    #[serde(default = "default_quarantine_subdir")]
    pub quarantine_subdir: String,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        DirectoriesConfig {
            working: default_working_dir(),
            logs: default_logs_dir(),
            quarantine_subdir: default_quarantine_subdir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_debounce_seconds")]
    pub debounce_interval_seconds: u64,
    #[serde(default = "default_min_file_count")]
    pub min_file_count_for_processing: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            debounce_interval_seconds: default_debounce_seconds(),
            min_file_count_for_processing: default_min_file_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_ignore_contour_names")]
    pub ignore_contour_names_containing: Vec<String>,
    #[serde(default = "default_overlay_series_number")]
    pub overlay_series_number: i32,
    #[serde(default = "default_overlay_series_description")]
    pub overlay_series_description: String,
    #[serde(default)]
    pub overlay_study_description: Option<String>,
    #[serde(default = "default_false")]
    pub add_burn_in_disclaimer: bool,
    #[serde(default = "default_burn_in_text")]
    pub burn_in_text: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            ignore_contour_names_containing: default_ignore_contour_names(),
            overlay_series_number: default_overlay_series_number(),
            overlay_series_description: default_overlay_series_description(),
            overlay_study_description: None,
            add_burn_in_disclaimer: false,
            burn_in_text: default_burn_in_text(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnonymizationRules {
    #[serde(default)]
    pub remove_tags: Vec<String>,
    #[serde(default)]
    pub blank_tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnonymizationConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "default_false")]
    pub full_anonymization_enabled: bool,
    #[serde(default)]
    pub rules: AnonymizationRules,
}

impl Default for AnonymizationConfig {
    fn default() -> Self {
        AnonymizationConfig {
            enabled: false,
            full_anonymization_enabled: false,
            rules: AnonymizationRules::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureFlagsConfig {
    #[serde(default = "default_false")]
    pub enable_segmentation_export: bool,
    #[serde(default = "default_false")]
    pub enable_debug_visualisation: bool,
}

impl Default for FeatureFlagsConfig {
    fn default() -> Self {
        FeatureFlagsConfig {
            enable_segmentation_export: false,
            enable_debug_visualisation: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_app_log_file")]
    pub application_log_file: String,
    #[serde(default = "default_transaction_log_file")]
    pub transaction_log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            application_log_file: default_app_log_file(),
            transaction_log_file: default_transaction_log_file(),
        }
    }
}

/// Worker-pool sizing for the pipeline. Not named as its own YAML section in
/// spec.md §6, but §5 requires it to be configurable; nested under
/// `processing` so the YAML schema stays within spec.md's enumerated
/// sections.
#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_pipeline_workers")]
    pub pipeline_workers: usize,
    #[serde(default = "default_max_associations")]
    pub max_concurrent_associations: usize,
}

fn default_pipeline_workers() -> usize {
    1
}
fn default_max_associations() -> usize {
    32
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        ConcurrencyConfig {
            pipeline_workers: default_pipeline_workers(),
            max_concurrent_associations: default_max_associations(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub dicom_listener: ListenerConfig,
    pub dicom_destination: DestinationConfig,
    #[serde(default)]
    pub directories: DirectoriesConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub anonymization: AnonymizationConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlagsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            reason: format!("could not read {}: {e}", path.display()),
        })?;
        let cfg: Config = serde_yaml::from_str(&raw).map_err(|e| Error::Config {
            reason: format!("could not parse {}: {e}", path.display()),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.watcher.min_file_count_for_processing == 0 {
            return Err(Error::Config {
                reason: "watcher.min_file_count_for_processing must be >= 1".to_string(),
            });
        }
        if self.concurrency.pipeline_workers == 0 {
            return Err(Error::Config {
                reason: "concurrency.pipeline_workers must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
dicom_destination:
  ip: 127.0.0.1
  ae_title: ARCHIVE
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.dicom_listener.port, 11112);
        assert_eq!(cfg.dicom_listener.ae_title, "NETRT");
        assert_eq!(cfg.watcher.debounce_interval_seconds, 5);
        assert_eq!(cfg.watcher.min_file_count_for_processing, 2);
        assert_eq!(
            cfg.processing.ignore_contour_names_containing,
            vec!["skull".to_string(), "patient_outline".to_string()]
        );
        assert_eq!(cfg.dicom_destination.port, 104);
    }

    #[test]
    fn rejects_zero_min_file_count() {
        let yaml = r#"
dicom_destination:
  ip: 127.0.0.1
  ae_title: ARCHIVE
watcher:
  min_file_count_for_processing: 0
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }
}
