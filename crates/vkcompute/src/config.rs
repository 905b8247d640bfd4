//! Runtime configuration.
//!
//! Loads [`ComputeConfig`] from a TOML file with environment variable
//! overrides. `USE_VIRTIOGPU` is honoured as the strict-selection toggle so
//! hardware-in-the-loop rigs keep working unchanged; everything else uses the
//! `VKCOMPUTE_*` prefix.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Red Hat, Inc. PCI vendor id (virtio devices).
pub const REDHAT_VENDOR_ID: u32 = 0x1af4;
/// virtio-gpu PCI device id.
pub const VIRTIO_GPU_DEVICE_ID: u32 = 0x1012;
/// Presence of this variable turns strict device matching on.
pub const STRICT_ENV_VAR: &str = "USE_VIRTIOGPU";
/// Default bound for the host-side fence wait.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(5);

const ENV_APP_NAME: &str = "VKCOMPUTE_APP_NAME";
const ENV_VALIDATION_LAYERS: &str = "VKCOMPUTE_VALIDATION_LAYERS";
const ENV_VENDOR_ID: &str = "VKCOMPUTE_VENDOR_ID";
const ENV_DEVICE_ID: &str = "VKCOMPUTE_DEVICE_ID";
const ENV_STRICT: &str = "VKCOMPUTE_STRICT";
const ENV_FENCE_TIMEOUT_MS: &str = "VKCOMPUTE_FENCE_TIMEOUT_MS";
const ENV_POOL_CAPACITY: &str = "VKCOMPUTE_POOL_CAPACITY";

/// Every variable [`ComputeConfig::apply_env_overrides`] reads.
pub const ENV_VARS: &[&str] = &[
    ENV_APP_NAME,
    ENV_VALIDATION_LAYERS,
    ENV_VENDOR_ID,
    ENV_DEVICE_ID,
    STRICT_ENV_VAR,
    ENV_STRICT,
    ENV_FENCE_TIMEOUT_MS,
    ENV_POOL_CAPACITY,
];

/// Which physical device to prefer, and whether a mismatch is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCriteria {
    /// Preferred PCI vendor id.
    pub vendor_id: u32,
    /// Preferred PCI device id.
    pub device_id: u32,
    /// Fail instead of falling back to the first enumerated device.
    pub strict: bool,
}

impl Default for DeviceCriteria {
    fn default() -> Self {
        Self { vendor_id: REDHAT_VENDOR_ID, device_id: VIRTIO_GPU_DEVICE_ID, strict: false }
    }
}

/// Compute core configuration loaded from TOML with environment overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Application name reported to the Vulkan loader.
    /// Override: `VKCOMPUTE_APP_NAME`
    pub application_name: String,

    /// Instance layers to enable, e.g. `VK_LAYER_KHRONOS_validation`.
    /// Override: `VKCOMPUTE_VALIDATION_LAYERS` (comma separated)
    pub validation_layers: Vec<String>,

    /// Host-side fence wait bound in milliseconds.
    /// Override: `VKCOMPUTE_FENCE_TIMEOUT_MS`
    pub fence_timeout_ms: u64,

    /// Descriptor sets the pool can hand out.
    /// Override: `VKCOMPUTE_POOL_CAPACITY`
    pub descriptor_pool_capacity: u32,

    /// Physical device preference, the `[device]` table.
    /// Overrides: `VKCOMPUTE_VENDOR_ID`, `VKCOMPUTE_DEVICE_ID`,
    /// `USE_VIRTIOGPU`, `VKCOMPUTE_STRICT`
    pub device: DeviceCriteria,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            application_name: "vkcompute".to_string(),
            validation_layers: Vec::new(),
            fence_timeout_ms: DEFAULT_FENCE_TIMEOUT.as_millis() as u64,
            descriptor_pool_capacity: 1,
            device: DeviceCriteria::default(),
        }
    }
}

/// Errors that can occur when loading or validating a [`ComputeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl ComputeConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: ComputeConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The fence wait bound as a [`Duration`].
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Validation("application_name must not be empty".into()));
        }
        if self.application_name.contains('\0') {
            return Err(ConfigError::Validation(
                "application_name must not contain NUL bytes".into(),
            ));
        }
        if let Some(layer) =
            self.validation_layers.iter().find(|l| l.is_empty() || l.contains('\0'))
        {
            return Err(ConfigError::Validation(format!("invalid layer name {layer:?}")));
        }
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::Validation("fence_timeout_ms must be > 0".into()));
        }
        if self.descriptor_pool_capacity == 0 {
            return Err(ConfigError::Validation("descriptor_pool_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Apply `VKCOMPUTE_*` and `USE_VIRTIOGPU` overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var(ENV_APP_NAME) {
            self.application_name = val;
        }

        if let Ok(val) = std::env::var(ENV_VALIDATION_LAYERS) {
            self.validation_layers = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(val) = std::env::var(ENV_VENDOR_ID) {
            self.device.vendor_id =
                parse_id(&val).map_err(|reason| env_err(ENV_VENDOR_ID, &val, reason))?;
        }

        if let Ok(val) = std::env::var(ENV_DEVICE_ID) {
            self.device.device_id =
                parse_id(&val).map_err(|reason| env_err(ENV_DEVICE_ID, &val, reason))?;
        }

        if std::env::var_os(STRICT_ENV_VAR).is_some() {
            self.device.strict = true;
        }

        if let Ok(val) = std::env::var(ENV_STRICT) {
            self.device.strict =
                parse_flag(&val).map_err(|reason| env_err(ENV_STRICT, &val, reason))?;
        }

        if let Ok(val) = std::env::var(ENV_FENCE_TIMEOUT_MS) {
            self.fence_timeout_ms = val
                .parse::<u64>()
                .map_err(|e| env_err(ENV_FENCE_TIMEOUT_MS, &val, e.to_string()))?;
        }

        if let Ok(val) = std::env::var(ENV_POOL_CAPACITY) {
            self.descriptor_pool_capacity = val
                .parse::<u32>()
                .map_err(|e| env_err(ENV_POOL_CAPACITY, &val, e.to_string()))?;
        }

        Ok(())
    }
}

fn env_err(key: &str, value: &str, reason: String) -> ConfigError {
    ConfigError::EnvOverride { key: key.into(), value: value.into(), reason }
}

/// Parse a PCI id written in decimal or `0x`-prefixed hex.
pub fn parse_id(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| e.to_string())
}

fn parse_flag(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleared_env() -> Vec<(&'static str, Option<&'static str>)> {
        ENV_VARS.iter().map(|k| (*k, None)).collect()
    }

    fn with_env<F: FnOnce()>(overrides: &[(&'static str, &'static str)], f: F) {
        let mut vars = cleared_env();
        for (key, value) in overrides {
            if let Some(slot) = vars.iter_mut().find(|(k, _)| k == key) {
                slot.1 = Some(*value);
            }
        }
        temp_env::with_vars(vars, f);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ComputeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_targets_virtio_gpu() {
        let cfg = ComputeConfig::default();
        assert_eq!(cfg.device.vendor_id, 0x1af4);
        assert_eq!(cfg.device.device_id, 0x1012);
        assert!(!cfg.device.strict);
        assert_eq!(cfg.fence_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_default_toml_round_trips() {
        let cfg: ComputeConfig = toml::from_str(&ComputeConfig::default_toml()).unwrap();
        assert_eq!(cfg, ComputeConfig::default());
    }

    #[test]
    #[serial(vkcompute_env)]
    fn test_from_toml_partial_table_keeps_defaults() {
        with_env(&[], || {
            let cfg = ComputeConfig::from_toml(
                r#"
fence_timeout_ms = 250

[device]
strict = true
"#,
            )
            .unwrap();
            assert_eq!(cfg.fence_timeout(), Duration::from_millis(250));
            assert!(cfg.device.strict);
            assert_eq!(cfg.device.vendor_id, REDHAT_VENDOR_ID);
            assert_eq!(cfg.descriptor_pool_capacity, 1);
        });
    }

    #[test]
    fn test_validation_zero_timeout() {
        let cfg = ComputeConfig { fence_timeout_ms: 0, ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("fence_timeout_ms must be > 0"));
    }

    #[test]
    fn test_validation_zero_pool_capacity() {
        let cfg = ComputeConfig { descriptor_pool_capacity: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_nul_in_app_name() {
        let cfg = ComputeConfig { application_name: "bad\0name".into(), ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    #[serial(vkcompute_env)]
    fn test_use_virtiogpu_presence_enables_strict() {
        with_env(&[(STRICT_ENV_VAR, "")], || {
            let cfg = ComputeConfig::from_env().unwrap();
            assert!(cfg.device.strict);
        });
    }

    #[test]
    #[serial(vkcompute_env)]
    fn test_strict_off_without_env() {
        with_env(&[], || {
            let cfg = ComputeConfig::from_env().unwrap();
            assert!(!cfg.device.strict);
        });
    }

    #[test]
    #[serial(vkcompute_env)]
    fn test_explicit_strict_flag_wins_over_presence() {
        with_env(&[(STRICT_ENV_VAR, "1"), (ENV_STRICT, "false")], || {
            let cfg = ComputeConfig::from_env().unwrap();
            assert!(!cfg.device.strict);
        });
    }

    #[test]
    #[serial(vkcompute_env)]
    fn test_env_override_multiple_fields() {
        with_env(
            &[
                (ENV_APP_NAME, "hil-rig"),
                (ENV_VALIDATION_LAYERS, "VK_LAYER_KHRONOS_validation, ,"),
                (ENV_VENDOR_ID, "0x10DE"),
                (ENV_DEVICE_ID, "7937"),
                (ENV_FENCE_TIMEOUT_MS, "1500"),
                (ENV_POOL_CAPACITY, "4"),
            ],
            || {
                let cfg = ComputeConfig::from_env().unwrap();
                assert_eq!(cfg.application_name, "hil-rig");
                assert_eq!(cfg.validation_layers, vec!["VK_LAYER_KHRONOS_validation".to_string()]);
                assert_eq!(cfg.device.vendor_id, 0x10de);
                assert_eq!(cfg.device.device_id, 7937);
                assert_eq!(cfg.fence_timeout_ms, 1500);
                assert_eq!(cfg.descriptor_pool_capacity, 4);
            },
        );
    }

    #[test]
    #[serial(vkcompute_env)]
    fn test_env_override_invalid_vendor() {
        with_env(&[(ENV_VENDOR_ID, "0xZZ")], || match ComputeConfig::from_env().unwrap_err() {
            ConfigError::EnvOverride { key, value, .. } => {
                assert_eq!(key, ENV_VENDOR_ID);
                assert_eq!(value, "0xZZ");
            }
            other => panic!("expected EnvOverride, got: {other}"),
        });
    }

    #[test]
    #[serial(vkcompute_env)]
    fn test_env_override_zero_timeout_fails_validation() {
        with_env(&[(ENV_FENCE_TIMEOUT_MS, "0")], || {
            assert!(matches!(ComputeConfig::from_env(), Err(ConfigError::Validation(_))));
        });
    }

    #[test]
    #[serial(vkcompute_env)]
    fn test_load_from_tempfile() {
        with_env(&[], || {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("vkcompute.toml");
            std::fs::write(&path, ComputeConfig::default_toml()).unwrap();
            assert_eq!(ComputeConfig::load(&path).unwrap(), ComputeConfig::default());
        });
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ComputeConfig::load(Path::new("/nonexistent/vkcompute.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_parse_id_accepts_hex_and_decimal() {
        assert_eq!(parse_id("0x1af4"), Ok(0x1af4));
        assert_eq!(parse_id("0X1012"), Ok(0x1012));
        assert_eq!(parse_id(" 4098 "), Ok(4098));
        assert!(parse_id("virtio").is_err());
    }
}
