//! # PMOSignage Configuration Module
//!
//! Typed configuration for the playout engine:
//! - loading from a YAML file, merged over the embedded defaults
//! - unit-carrying values ("15 SECS", "2 GiB") converted at the typed
//!   accessors through `pmoutils`
//! - no global state: the `Config` value is built once in `main` and
//!   passed down explicitly
//!
//! ## Usage
//!
//! ```no_run
//! use pmoconfig::Config;
//!
//! let config = Config::load("/etc/pmosignage/config.yaml")?;
//! let refresh = config.subscription_management.refresh_rate_secs()?;
//! # Ok::<(), pmoconfig::ConfigError>(())
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use pmoutils::conversions::{
    time_interval_in_seconds, unit_of_information_in_bytes, ConversionError,
};

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmosignage.yaml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SubscriptionManagement {
    pub subscription_root: String,
    pub refresh_rate: String,
    pub persist_to: PathBuf,
}

impl SubscriptionManagement {
    pub fn refresh_rate_secs(&self) -> Result<u64, ConfigError> {
        Ok(time_interval_in_seconds(&self.refresh_rate)?)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheFileStorage {
    pub cache_location: PathBuf,
    pub max_cache_size: String,
}

impl CacheFileStorage {
    pub fn max_cache_size_bytes(&self) -> Result<u64, ConfigError> {
        Ok(unit_of_information_in_bytes(&self.max_cache_size)?)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheMetaStorage {
    pub meta_store_path: PathBuf,
    pub index_table: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Scheduling {
    pub default_content_duration: String,
}

impl Scheduling {
    pub fn default_content_duration_secs(&self) -> Result<u64, ConfigError> {
        Ok(time_interval_in_seconds(&self.default_content_duration)?)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ContextStoreSection {
    pub context_store_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DisplayDeviceSection {
    pub serial_usb_name: String,
    pub device_type: String,
    pub display_timeout: String,
}

impl DisplayDeviceSection {
    pub fn display_timeout_secs(&self) -> Result<u64, ConfigError> {
        Ok(time_interval_in_seconds(&self.display_timeout)?)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Analytics {
    pub tracking_id: Option<String>,
    pub activate_extended_analytics: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Personalisation {
    pub ws_server_host: String,
    pub ws_server_path: String,
    pub display_id: String,
    pub beacon_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Facade {
    pub image_path: String,
    pub image_scale: f64,
    pub background_colour: String,
}

/// How a renderer subprocess expects to receive the artifact to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Path,
    Uri,
}

/// One entry of the mime → renderer table.
#[derive(Debug, Clone, Deserialize)]
pub struct RendererEntry {
    pub module: String,
    pub param_kind: ParamKind,
    pub precache: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub restart_renderer: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub subscription_management: SubscriptionManagement,
    pub cache_file_storage: CacheFileStorage,
    pub cache_meta_storage: CacheMetaStorage,
    pub scheduling: Scheduling,
    pub context_store: ContextStoreSection,
    pub display_device: DisplayDeviceSection,
    pub analytics: Analytics,
    pub personalisation: Personalisation,
    pub facade: Facade,
    pub renderers: HashMap<String, RendererEntry>,
}

impl Config {
    /// Built-in defaults, as shipped in `pmosignage.yaml`.
    pub fn builtin() -> Result<Config, ConfigError> {
        Ok(serde_yaml::from_str(DEFAULT_CONFIG)?)
    }

    /// Load the configuration file at `path`, merged key by key over
    /// the embedded defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("loading configuration from {}", path.display());
        Self::from_yaml(&text)
    }

    /// Parse a YAML document merged over the embedded defaults.
    pub fn from_yaml(text: &str) -> Result<Config, ConfigError> {
        let mut base: serde_yaml::Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        let overlay: serde_yaml::Value = serde_yaml::from_str(text)?;
        merge_yaml(&mut base, overlay);
        Ok(serde_yaml::from_value(base)?)
    }
}

/// Fusionne récursivement `overlay` dans `base` (les mappings sont
/// fusionnés clé par clé, toute autre valeur remplace). Un overlay
/// nul — fichier vide, section absente — ne remplace rien.
fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_defaults_parse() {
        let config = Config::builtin().unwrap();
        assert_eq!(config.scheduling.default_content_duration_secs().unwrap(), 15);
        assert!(config.renderers.contains_key("image"));
        assert_eq!(
            config.renderers["image"].param_kind,
            ParamKind::Path
        );
        assert!(!config.renderers["image"].restart_renderer);
        assert!(config.renderers["video"].restart_renderer);
    }

    #[test]
    fn overlay_merges_over_defaults() {
        let config = Config::from_yaml(
            "subscription_management:\n  subscription_root: \"/tmp/root.xml\"\n  refresh_rate: \"2 MINS\"\n",
        )
        .unwrap();
        assert_eq!(
            config.subscription_management.subscription_root,
            "/tmp/root.xml"
        );
        assert_eq!(
            config.subscription_management.refresh_rate_secs().unwrap(),
            120
        );
        // Une section non surchargée garde ses valeurs par défaut.
        assert_eq!(
            config.cache_file_storage.max_cache_size_bytes().unwrap(),
            2 * 1024u64.pow(3)
        );
    }

    #[test]
    fn unit_values_convert() {
        let config = Config::builtin().unwrap();
        assert_eq!(config.display_device.display_timeout_secs().unwrap(), 60);
    }

    #[test]
    fn an_empty_file_keeps_the_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.scheduling.default_content_duration_secs().unwrap(), 15);
    }
}
