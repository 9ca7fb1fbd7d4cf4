use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::limiter::{ConcurrencyLimiter, Parallelism, ServiceClass};
use crate::url_cache::MIN_REFRESH_INTERVAL;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSettings {
    pub version: u32,
    /// Turn the first recoverable fault into a hard failure for the run.
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub parallelism: BTreeMap<ServiceClass, Parallelism>,
    #[serde(default)]
    pub url_cache: UrlCacheSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlCacheSettings {
    pub refresh_interval_secs: u64,
    /// Drives with at least this many items get no url cache.
    pub max_drive_items: usize,
}

impl UrlCacheSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl Default for UrlCacheSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 3600,
            max_drive_items: 300_000,
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            fail_fast: false,
            parallelism: BTreeMap::new(),
            url_cache: UrlCacheSettings::default(),
        }
    }
}

impl BackupSettings {
    pub fn parallelism_for(&self, class: ServiceClass) -> Parallelism {
        self.parallelism.get(&class).copied().unwrap_or_default()
    }

    pub fn limiter(&self) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(self.parallelism.iter().map(|(c, p)| (*c, *p)))
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("backup.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<BackupSettings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(BackupSettings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<BackupSettings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<BackupSettings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

pub fn to_toml(settings: &BackupSettings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &BackupSettings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })
}

pub fn validate_settings(settings: &BackupSettings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    for (class, p) in &settings.parallelism {
        if p.item < 1 {
            return Err(Error::InvalidConfig {
                message: format!("parallelism.{class}.item must be >= 1"),
            });
        }
        if p.collection_buffer < 1 {
            return Err(Error::InvalidConfig {
                message: format!("parallelism.{class}.collection_buffer must be >= 1"),
            });
        }
    }

    if settings.url_cache.refresh_interval() < MIN_REFRESH_INTERVAL {
        return Err(Error::InvalidConfig {
            message: format!(
                "url_cache.refresh_interval_secs must be >= {}",
                MIN_REFRESH_INTERVAL.as_secs()
            ),
        });
    }
    if settings.url_cache.max_drive_items < 1 {
        return Err(Error::InvalidConfig {
            message: "url_cache.max_drive_items must be >= 1".to_string(),
        });
    }

    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
