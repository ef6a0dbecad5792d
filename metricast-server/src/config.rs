use std::{collections::HashSet, net::IpAddr, path::PathBuf, time::Duration};

use confique::Config;
use metricast_proto::Encoding;
use tracing::warn;

use crate::simulator::{RegimeClass, ServerSpec};

#[derive(Config, Debug)]
pub struct Conf {
    /// Port to listen on
    #[config(env = "METRICAST_PORT", default = 8080)]
    pub port: u16,

    /// Bind address
    #[config(env = "METRICAST_ADDRESS", default = "127.0.0.1")]
    pub address: IpAddr,

    /// Directory with a static dashboard, served at `/`
    #[config(env = "METRICAST_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    #[config(nested)]
    pub simulation: SimulationConf,
}

#[derive(Config, Debug)]
pub struct SimulationConf {
    /// Hostnames of the simulated servers
    #[config(default = ["server-1", "server-2", "server-3", "server-4", "server-5"])]
    pub servers: Vec<String>,

    /// Servers that tend to stay overloaded
    #[config(default = ["server-1", "server-2"])]
    pub overloaded_prone: Vec<String>,

    /// Servers that tend to stay offline
    #[config(default = ["server-3"])]
    pub offline_prone: Vec<String>,

    /// Milliseconds between two ticks of every simulator
    #[config(env = "METRICAST_TICK_INTERVAL_MS", default = 1000)]
    pub tick_interval_ms: u64,

    /// Samples buffered between the simulators and the broadcaster
    #[config(default = 256)]
    pub channel_capacity: usize,

    /// Samples buffered per viewer before it is considered too slow
    #[config(default = 64)]
    pub subscriber_buffer: usize,

    /// Wire format sent to viewers, `json` or `postcard`
    #[config(env = "METRICAST_ENCODING", default = "json")]
    pub encoding: Encoding,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no servers configured for simulation")]
    NoServers,
    #[error("server hostname must not be empty")]
    EmptyHostname,
    #[error("duplicate server hostname: {0}")]
    DuplicateServer(String),
    #[error("server {0} is listed as both overloaded-prone and offline-prone")]
    ConflictingClass(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

pub fn load(path: &str) -> anyhow::Result<Conf> {
    Conf::builder()
        .env()
        .file(path)
        .load()
        .map_err(|e| e.into())
}

impl SimulationConf {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Resolve the configured servers and their regime classes.
    pub fn fleet(&self) -> Result<Vec<ServerSpec>, ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Zero("tick_interval_ms"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Zero("channel_capacity"));
        }
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::Zero("subscriber_buffer"));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        let mut seen = HashSet::new();
        for hostname in &self.servers {
            if hostname.is_empty() {
                return Err(ConfigError::EmptyHostname);
            }
            if !seen.insert(hostname.as_str()) {
                return Err(ConfigError::DuplicateServer(hostname.clone()));
            }
        }

        if let Some(hostname) = self
            .overloaded_prone
            .iter()
            .find(|h| self.offline_prone.contains(h))
        {
            return Err(ConfigError::ConflictingClass(hostname.clone()));
        }

        for hostname in self.overloaded_prone.iter().chain(&self.offline_prone) {
            if !seen.contains(hostname.as_str()) {
                warn!(%hostname, "regime class given for a server that is not simulated");
            }
        }

        Ok(self
            .servers
            .iter()
            .map(|hostname| ServerSpec {
                hostname: hostname.clone(),
                class: self.class_of(hostname),
            })
            .collect())
    }

    fn class_of(&self, hostname: &str) -> RegimeClass {
        if self.overloaded_prone.iter().any(|h| h == hostname) {
            RegimeClass::OverloadedProne
        } else if self.offline_prone.iter().any(|h| h == hostname) {
            RegimeClass::OfflineProne
        } else {
            RegimeClass::NormalProne
        }
    }
}
