use std::{fs, path::Path, str::FromStr};

use clap::ValueEnum;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use rsops_common::MAX_FLOW_ENTRIES;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rsops/rsops.toml";

/// Default cpumap queue size, in frames
pub const DEFAULT_QUEUE_SIZE: u32 = 2048;

/// Default size of each per-CPU perf buffer, in pages
pub const DEFAULT_PERF_PAGES: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub flows: FlowsConfig,
    pub redirect: RedirectConfig,
    pub pass: PassConfig,
    pub dump: DumpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowsConfig {
    pub iface: String,
    pub max_flows: u32,
    pub report_interval_secs: u64,
    /// Delete flows from the kernel table once they have been reported
    pub drain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub iface: String,
    /// Target CPU; left unset the program passes every frame through
    pub cpu: Option<u32>,
    pub queue_size: u32,
    pub xdp_mode: XdpMode,
    pub update_if_noexist: bool,
    pub report_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    pub iface: String,
    pub xdp_mode: XdpMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub iface: String,
    pub xdp_mode: XdpMode,
    /// Pages per CPU for the event buffer, a power of two
    pub perf_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// How the XDP program is attached to the interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    /// Let the kernel pick (native if the driver supports it)
    #[default]
    Default,
    /// Generic mode, works on any interface
    Skb,
    /// Native driver mode
    Drv,
    /// Offloaded to the NIC
    Hw,
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            iface: "eth0".to_string(),
            max_flows: MAX_FLOW_ENTRIES,
            report_interval_secs: 5,
            drain: false,
        }
    }
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            iface: "eth0".to_string(),
            cpu: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            xdp_mode: XdpMode::Default,
            update_if_noexist: false,
            report_interval_secs: 5,
        }
    }
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            iface: "eth0".to_string(),
            xdp_mode: XdpMode::Default,
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            iface: "eth0".to_string(),
            xdp_mode: XdpMode::Default,
            perf_pages: DEFAULT_PERF_PAGES,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load the configuration file, falling back to defaults when it does not
    /// exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.logging.level_filter()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl FlowsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_iface(&self.iface)?;
        if self.max_flows == 0 {
            return Err(ConfigError::Zero("max_flows"));
        }
        if self.report_interval_secs == 0 {
            return Err(ConfigError::Zero("report_interval_secs"));
        }
        Ok(())
    }
}

impl RedirectConfig {
    /// `possible_cpus` is the size of the kernel cpumap.
    pub fn validate(&self, possible_cpus: u32) -> Result<(), ConfigError> {
        validate_iface(&self.iface)?;
        if self.queue_size == 0 {
            return Err(ConfigError::Zero("queue_size"));
        }
        if self.report_interval_secs == 0 {
            return Err(ConfigError::Zero("report_interval_secs"));
        }
        if let Some(cpu) = self.cpu {
            if cpu >= possible_cpus {
                return Err(ConfigError::CpuOutOfRange {
                    cpu,
                    possible: possible_cpus,
                });
            }
        }
        Ok(())
    }
}

impl PassConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_iface(&self.iface)
    }
}

impl DumpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_iface(&self.iface)?;
        if !self.perf_pages.is_power_of_two() {
            return Err(ConfigError::PerfPages(self.perf_pages));
        }
        Ok(())
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.level).map_err(|_| ConfigError::LogLevel(self.level.clone()))
    }
}

fn validate_iface(iface: &str) -> Result<(), ConfigError> {
    if iface.is_empty() {
        return Err(ConfigError::EmptyInterface);
    }
    Ok(())
}
