//! Bridge configuration management

use crate::usb::EnginePolicy;
use anyhow::{Context, Result, anyhow};
use protocol::{DecodePolicy, HID_CLASS, HID_PROTOCOL_MOUSE, HID_SUBCLASS_BOOT, InterfaceFilter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where decoded reports go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One human-readable line per report
    #[default]
    Text,
    /// One JSON object per report
    Json,
    /// Buttons remapped to keys, printed as input events
    Keys,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub log_level: String,
    pub output: OutputFormat,
    /// Text output only: skip reports with no buttons held and no motion
    pub activity_only: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            output: OutputFormat::Text,
            activity_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID allow list, empty allows every device
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default = "UsbSettings::default_class")]
    pub interface_class: u8,
    /// `None` accepts any subclass, written as `"any"`
    #[serde(default = "UsbSettings::default_subclass", with = "subclass_setting")]
    pub interface_subclass: Option<u8>,
    #[serde(default = "UsbSettings::default_protocol")]
    pub interface_protocol: u8,
    /// Timeout of one blocking read attempt in the reader threads
    #[serde(default = "UsbSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Longest single wait in the dispatch loop
    #[serde(default = "UsbSettings::default_event_timeout")]
    pub event_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            interface_class: Self::default_class(),
            interface_subclass: Self::default_subclass(),
            interface_protocol: Self::default_protocol(),
            poll_interval_ms: Self::default_poll_interval(),
            event_timeout_ms: Self::default_event_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_class() -> u8 {
        HID_CLASS
    }

    fn default_subclass() -> Option<u8> {
        Some(HID_SUBCLASS_BOOT)
    }

    fn default_protocol() -> u8 {
        HID_PROTOCOL_MOUSE
    }

    fn default_poll_interval() -> u64 {
        100
    }

    fn default_event_timeout() -> u64 {
        250
    }
}

/// `interface_subclass` is either a subclass code or `"any"`
mod subclass_setting {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    const ANY: &str = "any";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Code(u8),
        Word(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(code) => serializer.serialize_u8(*code),
            None => serializer.serialize_str(ANY),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Code(code) => Ok(Some(code)),
            Raw::Word(word) if word.eq_ignore_ascii_case(ANY) => Ok(None),
            Raw::Word(word) => Err(D::Error::custom(format!(
                "invalid interface_subclass '{}', expected 0-255 or \"any\"",
                word
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default)]
    pub decode_policy: DecodePolicy,
    /// Consecutive transient failures tolerated per device, unlimited if unset
    #[serde(default)]
    pub max_transient_retries: Option<u32>,
    /// How long shutdown waits for cancelled reads to retire
    #[serde(default = "TransferSettings::default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            decode_policy: DecodePolicy::Lenient,
            max_transient_retries: None,
            drain_timeout_ms: Self::default_drain_timeout(),
        }
    }
}

impl TransferSettings {
    fn default_drain_timeout() -> u64 {
        2000
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/hid-bridge/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
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
            config_dir.join("hid-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/hid-bridge/bridge.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        if self.usb.poll_interval_ms == 0 {
            return Err(anyhow!("usb.poll_interval_ms must be greater than 0"));
        }
        if self.usb.event_timeout_ms == 0 {
            return Err(anyhow!("usb.event_timeout_ms must be greater than 0"));
        }
        if self.transfer.drain_timeout_ms == 0 {
            return Err(anyhow!("transfer.drain_timeout_ms must be greater than 0"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x046d:0xc077' or '0x046d:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x046d')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }

    pub fn interface_filter(&self) -> InterfaceFilter {
        InterfaceFilter {
            class: self.usb.interface_class,
            subclass: self.usb.interface_subclass,
            protocol: self.usb.interface_protocol,
        }
    }

    pub fn engine_policy(&self) -> EnginePolicy {
        EnginePolicy {
            decode: self.transfer.decode_policy,
            max_transient_retries: self.transfer.max_transient_retries,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.usb.poll_interval_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.usb.event_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.bridge.log_level, "info");
        assert_eq!(config.bridge.output, OutputFormat::Text);
        assert_eq!(config.interface_filter(), InterfaceFilter::boot_mouse());
        assert_eq!(config.engine_policy(), EnginePolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(BridgeConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(BridgeConfig::validate_filter("0x1234:*").is_ok());
        assert!(BridgeConfig::validate_filter("*:0x5678").is_ok());
        assert!(BridgeConfig::validate_filter("*:*").is_ok());
        assert!(BridgeConfig::validate_filter("0xABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(BridgeConfig::validate_filter("1234:5678").is_err());
        assert!(BridgeConfig::validate_filter("0x1234").is_err());
        assert!(BridgeConfig::validate_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(BridgeConfig::validate_filter("0xGHIJ:0x5678").is_err());
        assert!(BridgeConfig::validate_filter("0x12345:0x5678").is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = BridgeConfig::default();
        config.transfer.max_transient_retries = Some(5);
        config.bridge.output = OutputFormat::Keys;

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.bridge.output, OutputFormat::Keys);
        assert_eq!(parsed.transfer.max_transient_retries, Some(5));
        assert_eq!(parsed.usb.interface_protocol, HID_PROTOCOL_MOUSE);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = BridgeConfig::default();
        config.bridge.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.bridge.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = BridgeConfig::default();
        config.usb.event_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.transfer.drain_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
