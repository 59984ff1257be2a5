//! RingLink CLI configuration
//!
//! Configuration is read from a TOML file: the one given with `--config`, else
//! `~/.ringlink/config.toml` when it exists, else built-in defaults. Missing keys
//! fall back to their defaults, so a file only needs the values it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use ringlink_core::{PlatformVersion, RingLinkConfig};

use crate::error::{CliError, Result};

const CONFIG_DIR: &str = ".ringlink";
const CONFIG_FILE: &str = "config.toml";
const DEVICE_FILE: &str = "device.json";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Which radio stack the engine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioBackend {
    /// In-process radio with virtual rings
    Simulated,
    /// Host adapter through btleplug (`ble` feature)
    Ble,
}

/// Complete configuration for the CLI application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Connection engine configuration
    pub engine: RingLinkConfig,

    /// CLI-specific configuration
    pub cli: CliConfig,

    /// Virtual rings served by the simulated radio
    pub simulation: SimulationConfig,

    /// Host adapter configuration
    #[cfg(feature = "ble")]
    pub ble: ringlink_ble::BleRadioConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,

    /// Directory holding the device record (defaults to ~/.ringlink)
    pub data_dir: Option<PathBuf>,

    /// Platform API level used for access-grant decisions
    pub platform_version: u32,

    pub backend: RadioBackend,

    /// Upper bound on waiting for a connection to settle
    pub connect_wait: Duration,
}

/// One virtual ring advertised by the simulated radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedRing {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub rings: Vec<SimulatedRing>,
    /// Time between advertisements of each ring
    pub advertise_interval: Duration,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            data_dir: None,
            platform_version: 34,
            backend: RadioBackend::Simulated,
            connect_wait: Duration::from_secs(60),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rings: vec![
                SimulatedRing {
                    address: "C0:FF:EE:00:00:01".to_string(),
                    name: Some("Q_Ring_01".to_string()),
                    rssi: -58,
                },
                SimulatedRing {
                    address: "C0:FF:EE:00:00:02".to_string(),
                    name: Some("R02_7A1C".to_string()),
                    rssi: -77,
                },
            ],
            advertise_interval: Duration::from_secs(1),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load from `path`, or from the default location when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => {
                let default_path = Self::default_config_path()?;
                if default_path.exists() {
                    Self::load_from_file(default_path)
                } else {
                    info!("Using default configuration");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Loading configuration from: {}", path.as_ref().display());
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        if self.cli.connect_wait.is_zero() {
            return Err(CliError::Config("cli.connect_wait must be positive".into()));
        }
        if self.simulation.advertise_interval.is_zero() {
            return Err(CliError::Config(
                "simulation.advertise_interval must be positive".into(),
            ));
        }
        for ring in &self.simulation.rings {
            if ring.address.trim().is_empty() {
                return Err(CliError::Config("simulated ring without an address".into()));
            }
        }
        if self.cli.backend == RadioBackend::Ble && !cfg!(feature = "ble") {
            return Err(CliError::FeatureNotAvailable(
                "BLE backend requires building with the `ble` feature".into(),
            ));
        }
        Ok(())
    }

    pub fn platform(&self) -> PlatformVersion {
        PlatformVersion(self.cli.platform_version)
    }

    /// Directory holding configuration and the device record
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.cli.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => home_dir().map(|home| home.join(CONFIG_DIR)),
        }
    }

    pub fn device_store_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DEVICE_FILE))
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE))
    }
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| CliError::Config("no home directory".into()))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cli.backend, RadioBackend::Simulated);
        assert_eq!(config.platform(), PlatformVersion(34));
        assert_eq!(config.simulation.rings.len(), 2);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[cli]\nplatform_version = 30\n\n[engine.scan]\nmin_rssi_dbm = -80\n",
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.cli.platform_version, 30);
        assert_eq!(config.engine.scan.min_rssi_dbm, -80);
        assert_eq!(
            config.engine.scan.name_prefixes,
            RingLinkConfig::default().scan.name_prefixes
        );
        assert_eq!(config.simulation, SimulationConfig::default());
    }

    #[test]
    fn test_written_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.cli.data_dir = Some(dir.path().to_path_buf());
        config.engine = config.engine.with_auto_reconnect(false);
        config.save_to_file(&path).unwrap();

        assert_eq!(AppConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.engine.scan.name_prefixes = Vec::new();
        assert!(matches!(config.validate(), Err(CliError::Config(_))));

        let mut config = AppConfig::default();
        config.simulation.advertise_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[cfg(not(feature = "ble"))]
    #[test]
    fn test_ble_backend_needs_feature() {
        let mut config = AppConfig::default();
        config.cli.backend = RadioBackend::Ble;
        assert!(matches!(
            config.validate(),
            Err(CliError::FeatureNotAvailable(_))
        ));
    }

    #[test]
    fn test_device_store_under_data_dir() {
        let mut config = AppConfig::default();
        config.cli.data_dir = Some(PathBuf::from("/tmp/ringlink-test"));
        assert_eq!(
            config.device_store_path().unwrap(),
            PathBuf::from("/tmp/ringlink-test/device.json")
        );
    }
}
