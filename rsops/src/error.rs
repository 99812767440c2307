use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("interface name must not be empty")]
    EmptyInterface,
    #[error("cpu {cpu} is out of range, this host has {possible} possible cpus")]
    CpuOutOfRange { cpu: u32, possible: u32 },
    #[error("perf_pages must be a power of two, got {0}")]
    PerfPages(usize),
    #[error("invalid log filter {0:?}")]
    LogLevel(String),
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("interface name {0:?} contains a NUL byte")]
    InvalidName(String),
    #[error("interface {0} not found")]
    UnknownInterface(String),
    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        SocketError::Syscall {
            op,
            source: io::Error::last_os_error(),
        }
    }
}
