//! Configuration management (TOML)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Seconds between scans.
    pub sample_interval: u64,
    /// Log the top-N selection after each scan.
    pub log_top: bool,
}

/// Everything the collection pipeline needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Process name regexes. A process is kept if any of them matches; an
    /// empty list keeps everything.
    pub procs: Vec<String>,
    /// Root under which `/proc` is read. `None` means `/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostfs: Option<PathBuf>,
    /// Run the extended (privileged) collection tier.
    pub extended: bool,
    pub cpu_ticks: bool,
    pub cache_cmdline: bool,
    /// Environment variable key regexes. Empty disables environment capture.
    pub env_whitelist: Vec<String>,
    pub include_top: IncludeTopConfig,
    pub cgroups: CgroupConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncludeTopConfig {
    pub enabled: bool,
    pub by_cpu: usize,
    pub by_memory: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    pub enabled: bool,
    pub ignore_root_cgroups: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            sample_interval: 10,
            log_top: true,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            procs: vec![".*".to_string()],
            hostfs: None,
            extended: true,
            cpu_ticks: true,
            cache_cmdline: true,
            env_whitelist: vec![],
            include_top: IncludeTopConfig::default(),
            cgroups: CgroupConfig::default(),
        }
    }
}

impl Default for IncludeTopConfig {
    fn default() -> Self {
        IncludeTopConfig {
            enabled: true,
            by_cpu: 5,
            by_memory: 5,
        }
    }
}

impl Default for CgroupConfig {
    fn default() -> Self {
        CgroupConfig {
            enabled: false,
            ignore_root_cgroups: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "proctel")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }
}
