//! Configuration file management for the Skiff daemon
//! Stores the listen port and port forwarding settings in platform-specific config directories:
//! - Windows: %APPDATA%\Skiff\config.json
//! - macOS: ~/Library/Application Support/Skiff/config.json
//! - Linux: ~/.config/Skiff/config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use skiff_core::PortMappingSettings;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_true")]
    pub port_mapping_enabled: bool,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
    #[serde(default = "default_port_check_url")]
    pub port_check_url: String,
}

fn default_listen_port() -> u16 {
    49000
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_discovery_timeout_secs() -> u64 {
    5
}

fn default_port_check_url() -> String {
    "http://portcheck.transmissionbt.com/".to_string()
}

const MIN_PORT: u16 = 1024;
const MAX_PORT: u16 = 65535;
const MIN_REFRESH_INTERVAL_SECS: u64 = 5;
const MAX_DISCOVERY_TIMEOUT_SECS: u64 = 60;
const MAX_URL_LENGTH: usize = 2048;

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            port_mapping_enabled: default_true(),
            refresh_interval_secs: default_refresh_interval_secs(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
            port_check_url: default_port_check_url(),
        }
    }
}

impl DaemonConfig {
    /// Address the engine binds for peer traffic.
    pub fn local_listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }

    pub fn port_mapping_settings(&self) -> PortMappingSettings {
        PortMappingSettings {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            port_check_url: self.port_check_url.clone(),
            ..Default::default()
        }
    }
}

/// Get the config file path using platform-specific directories.
///
/// Returns:
/// - Windows: `%APPDATA%\Skiff\config.json`
/// - macOS: `~/Library/Application Support/Skiff/config.json`
/// - Linux: `~/.config/Skiff/config.json`
pub fn config_path() -> Result<PathBuf> {
    let config_dir = if cfg!(target_os = "windows") {
        let appdata = std::env::var("APPDATA")
            .context("APPDATA environment variable not set")?;
        PathBuf::from(appdata).join("Skiff")
    } else if cfg!(target_os = "macos") {
        let home = std::env::var("HOME")
            .context("HOME environment variable not set")?;
        PathBuf::from(home).join("Library").join("Application Support").join("Skiff")
    } else {
        let home = std::env::var("HOME")
            .context("HOME environment variable not set")?;
        PathBuf::from(home).join(".config").join("Skiff")
    };

    Ok(config_dir.join("config.json"))
}

/// Load configuration from file, or return default if file doesn't exist
pub async fn load_config() -> Result<DaemonConfig> {
    load_config_from(&config_path()?).await
}

pub async fn load_config_from(config_file: &Path) -> Result<DaemonConfig> {
    if !config_file.exists() {
        let config = DaemonConfig::default();
        save_config_to(config_file, &config).await?;
        return Ok(config);
    }

    let content = tokio::fs::read_to_string(config_file)
        .await
        .context("Failed to read config file")?;

    let config: DaemonConfig = serde_json::from_str(&content)
        .context("Failed to parse config file")?;

    validate_config(&config)?;

    Ok(config)
}

pub async fn save_config_to(config_file: &Path, config: &DaemonConfig) -> Result<()> {
    if let Some(parent) = config_file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create config directory")?;
    }

    let content = serde_json::to_string_pretty(config)
        .context("Failed to serialize config")?;

    tokio::fs::write(config_file, content)
        .await
        .context("Failed to write config file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(config_file)
            .await
            .context("Failed to get config file metadata")?
            .permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(config_file, perms)
            .await
            .context("Failed to set config file permissions")?;
    }

    Ok(())
}

fn validate_config(config: &DaemonConfig) -> Result<()> {
    if config.listen_port < MIN_PORT {
        return Err(anyhow::anyhow!(
            "Invalid listen_port: {} (must be between {} and {})",
            config.listen_port,
            MIN_PORT,
            MAX_PORT
        ));
    }

    if config.refresh_interval_secs < MIN_REFRESH_INTERVAL_SECS {
        return Err(anyhow::anyhow!(
            "Invalid refresh_interval_secs: {} (must be at least {})",
            config.refresh_interval_secs,
            MIN_REFRESH_INTERVAL_SECS
        ));
    }

    if config.discovery_timeout_secs == 0 || config.discovery_timeout_secs > MAX_DISCOVERY_TIMEOUT_SECS {
        return Err(anyhow::anyhow!(
            "Invalid discovery_timeout_secs: {} (must be between 1 and {})",
            config.discovery_timeout_secs,
            MAX_DISCOVERY_TIMEOUT_SECS
        ));
    }

    let url = &config.port_check_url;
    if url.len() > MAX_URL_LENGTH || !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(anyhow::anyhow!("Invalid port_check_url: must be an http(s) URL"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("Skiff").join("config.json");
        let config = load_config_from(&path).await.expect("load");
        assert_eq!(config, DaemonConfig::default());
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn partial_file_takes_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"listen_port": 51413, "port_mapping_enabled": false}"#).expect("write");
        let config = load_config_from(&path).await.expect("load");
        assert_eq!(config.listen_port, 51413);
        assert!(!config.port_mapping_enabled);
        assert_eq!(config.refresh_interval_secs, 60);
        assert_eq!(config.local_listen_addr(), "0.0.0.0:51413");
    }

    #[tokio::test]
    async fn out_of_range_values_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        for body in [
            r#"{"listen_port": 80}"#,
            r#"{"refresh_interval_secs": 1}"#,
            r#"{"discovery_timeout_secs": 0}"#,
            r#"{"discovery_timeout_secs": 61}"#,
            r#"{"port_check_url": "ftp://example.com/"}"#,
        ] {
            std::fs::write(&path, body).expect("write");
            assert!(load_config_from(&path).await.is_err(), "{} must be rejected", body);
        }
    }

    #[test]
    fn settings_carry_intervals_and_lease() {
        let config = DaemonConfig {
            refresh_interval_secs: 30,
            discovery_timeout_secs: 2,
            ..Default::default()
        };
        let settings = config.port_mapping_settings();
        assert_eq!(settings.refresh_interval, Duration::from_secs(30));
        assert_eq!(settings.discovery_timeout, Duration::from_secs(2));
        assert_eq!(settings.lease(), Duration::from_secs(60));
        assert_eq!(settings.port_check_url, "http://portcheck.transmissionbt.com/");
    }
}
