//! Configuration loading

use anyhow::Result;
use scanbus_core::{DecodeMode, LookupTables};
use scanbus_transport::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub scanner: ScanConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Attempts per register transaction while the node answers busy
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Extra sends of an FCP command whose write failed
    #[serde(default = "default_fcp_send_retries")]
    pub fcp_send_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            fcp_send_retries: default_fcp_send_retries(),
        }
    }
}

impl TransportConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
    }
}

fn default_max_attempts() -> u32 {
    20
}

fn default_retry_delay_ms() -> u64 {
    10
}

fn default_fcp_send_retries() -> u32 {
    scanbus_transport::fcp::DEFAULT_SEND_RETRIES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupConfig {
    /// Candidate GUID table files, first existing one wins
    #[serde(default = "default_guid_paths")]
    pub guid_paths: Vec<PathBuf>,
    /// Candidate vendor (OUI) table files, first existing one wins
    #[serde(default = "default_oui_paths")]
    pub oui_paths: Vec<PathBuf>,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            guid_paths: default_guid_paths(),
            oui_paths: default_oui_paths(),
        }
    }
}

impl LookupConfig {
    pub fn load_tables(&self) -> Result<LookupTables> {
        Ok(LookupTables::load(&self.guid_paths, &self.oui_paths)?)
    }
}

fn default_guid_paths() -> Vec<PathBuf> {
    scanbus_core::resolve::default_search_paths("guid-resolv.conf", Path::new("/etc"))
}

fn default_oui_paths() -> Vec<PathBuf> {
    scanbus_core::resolve::default_search_paths("oui-resolv.conf", Path::new("/etc"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Reject SelfID packets with bad tag bits instead of ignoring them
    #[serde(default)]
    pub strict: bool,
}

impl DecoderConfig {
    pub fn mode(&self) -> DecodeMode {
        if self.strict {
            DecodeMode::Strict
        } else {
            DecodeMode::Tolerant
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Periodic rescan interval in seconds (0 to rescan only on bus reset)
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
    /// Rebuilds performed after each bus reset while the bus settles
    #[serde(default = "default_settle_rescans")]
    pub reset_settle_rescans: u32,
    /// Pause between settle rebuilds in milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            rescan_interval_secs: default_rescan_interval(),
            reset_settle_rescans: default_settle_rescans(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

fn default_rescan_interval() -> u64 {
    0
}

fn default_settle_rescans() -> u32 {
    10
}

fn default_settle_delay_ms() -> u64 {
    100
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<ScannerConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: ScannerConfig = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(ScannerConfig::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&ScannerConfig::default())?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("scanbus.toml")).unwrap();

        assert_eq!(config, ScannerConfig::default());
        assert_eq!(config.transport.retry_policy(), RetryPolicy::default());
        assert_eq!(config.decoder.mode(), DecodeMode::Tolerant);
        assert_eq!(config.scanner.reset_settle_rescans, 10);
        assert_eq!(
            config.lookup.guid_paths,
            vec![
                PathBuf::from("guid-resolv.conf"),
                PathBuf::from("/etc/guid-resolv.conf")
            ]
        );
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanbus.toml");
        std::fs::write(
            &path,
            "[transport]\nmax_attempts = 5\n\n[decoder]\nstrict = true\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.transport.max_attempts, 5);
        assert_eq!(config.transport.retry_delay_ms, 10);
        assert_eq!(config.decoder.mode(), DecodeMode::Strict);
        assert_eq!(config.scanner, ScanConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanbus.toml");

        save_default_config(&path).unwrap();
        assert_eq!(load_config(&path).unwrap(), ScannerConfig::default());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanbus.toml");
        std::fs::write(&path, "[transport]\nmax_attempts = \"many\"\n").unwrap();

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_load_tables_from_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        let oui = dir.path().join("oui-resolv.conf");
        std::fs::write(&oui, "080046 Sony\n").unwrap();

        let lookup = LookupConfig {
            guid_paths: vec![dir.path().join("guid-resolv.conf")],
            oui_paths: vec![oui],
        };
        let tables = lookup.load_tables().unwrap();
        assert_eq!(tables.vendor_count(), 1);
        assert_eq!(tables.guid_count(), 0);
    }
}
