use crate::error::*;
use crate::version_util::VersionUtil;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PLATFORM_VERSION: &str = "1.1.0";

fn default_install_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("addons"))
        .unwrap_or_else(|| PathBuf::from("addons"))
}

fn default_platform_version() -> String {
    DEFAULT_PLATFORM_VERSION.to_string()
}

fn default_http_timeout_secs() -> u64 {
    60
}

fn default_unpack_workers() -> usize {
    2
}

fn default_progress_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    #[serde(default = "default_install_root")]
    pub install_root: PathBuf,
    #[serde(default = "default_platform_version")]
    pub platform_version: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_unpack_workers")]
    pub unpack_workers: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    // local archives are consumed after a successful install unless set
    #[serde(default)]
    pub keep_local_archive: bool,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            install_root: default_install_root(),
            platform_version: default_platform_version(),
            http_timeout_secs: default_http_timeout_secs(),
            unpack_workers: default_unpack_workers(),
            progress_interval_ms: default_progress_interval_ms(),
            keep_local_archive: false,
        }
    }
}

impl InstallerConfig {
    pub fn new(install_root: PathBuf) -> Self {
        Self {
            install_root,
            ..Default::default()
        }
    }

    pub fn from_toml(content: &str) -> AddonResult<Self> {
        let config: InstallerConfig = toml::from_str(content)
            .map_err(|err| AddonError::ConfigError(format!("parse config failed: {}", err)))?;
        config.platform_version()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AddonResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            AddonError::ConfigError(format!("read config {} failed: {}", path.display(), err))
        })?;
        Self::from_toml(&content)
    }

    pub fn platform_version(&self) -> AddonResult<Version> {
        VersionUtil::parse(&self.platform_version).map_err(|_| {
            AddonError::ConfigError(format!(
                "platform_version {} is not a semantic version",
                self.platform_version
            ))
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
