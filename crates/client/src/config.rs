//! Client configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transport::usb::UsbFilter;
use transport::{BdAddr, BluetoothSettings, TcpSettings, UsbSettings};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    #[serde(default)]
    pub usb: UsbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Network printer defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Printer host used when none is given on the command line
    pub host: Option<String>,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub recv_buffer: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        let settings = TcpSettings::default();
        Self {
            host: None,
            port: transport::tcp::DEFAULT_PORT,
            connect_timeout_ms: settings.connect_timeout.as_millis() as u64,
            recv_buffer: settings.recv_buffer,
        }
    }
}

impl TcpConfig {
    pub fn settings(&self) -> TcpSettings {
        TcpSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            recv_buffer: self.recv_buffer,
        }
    }
}

/// Bluetooth printer defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Printer address (`XX:XX:XX:XX:XX:XX`)
    pub address: Option<String>,
    pub channel: u8,
    /// Name reported when the adapter cannot resolve one
    pub name: Option<String>,
    pub recv_buffer: usize,
    /// Ask the Bluetooth stack for the printer's name after connecting
    pub resolve_name: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        let settings = BluetoothSettings::default();
        Self {
            address: None,
            channel: transport::bluetooth::DEFAULT_CHANNEL,
            name: None,
            recv_buffer: settings.recv_buffer,
            resolve_name: settings.resolve_name,
        }
    }
}

impl BluetoothConfig {
    pub fn settings(&self) -> BluetoothSettings {
        BluetoothSettings {
            recv_buffer: self.recv_buffer,
            resolve_name: self.resolve_name,
        }
    }
}

/// USB printer selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    /// Device filters in `VID:PID` form, `*` matching any product
    ///
    /// An empty list accepts every device.
    pub filters: Vec<String>,
    /// Interface holding the bulk endpoints
    pub interface: u8,
    pub recv_buffer: usize,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            filters: vec![UsbFilter::default().to_string()],
            interface: 0,
            recv_buffer: UsbSettings::default().recv_buffer,
        }
    }
}

impl UsbConfig {
    pub fn settings(&self) -> UsbSettings {
        UsbSettings {
            recv_buffer: self.recv_buffer,
        }
    }

    /// Parse the configured filter strings
    pub fn parsed_filters(&self) -> Result<Vec<UsbFilter>> {
        self.filters
            .iter()
            .map(|f| {
                f.parse::<UsbFilter>()
                    .with_context(|| format!("Invalid USB filter in config: '{}'", f))
            })
            .collect()
    }
}

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/printlink/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: tcp host={:?}, bluetooth address={:?}, {} usb filters",
            config.tcp.host,
            config.bluetooth.address,
            config.usb.filters.len()
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Logging is not set up yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("printlink").join("client.toml")
        } else {
            PathBuf::from(".config/printlink/client.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.tcp.port == 0 {
            return Err(anyhow!("TCP port must not be 0"));
        }
        if self.tcp.connect_timeout_ms == 0 {
            return Err(anyhow!("TCP connect timeout must be greater than 0"));
        }

        if let Some(address) = &self.bluetooth.address {
            address
                .parse::<BdAddr>()
                .context("Invalid Bluetooth address in config")?;
        }
        if !(1..=30).contains(&self.bluetooth.channel) {
            return Err(anyhow!(
                "RFCOMM channel {} out of range 1-30",
                self.bluetooth.channel
            ));
        }

        self.usb.parsed_filters()?;

        for (name, size) in [
            ("tcp", self.tcp.recv_buffer),
            ("bluetooth", self.bluetooth.recv_buffer),
            ("usb", self.usb.recv_buffer),
        ] {
            if size == 0 {
                return Err(anyhow!("{} recv_buffer must be greater than 0", name));
            }
        }

        Ok(())
    }
}
