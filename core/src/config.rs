use crate::logging::LoggingConfig;
use crate::net::NetworkConfig;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Worker-pool sizing for the dispatcher described in the ambient stack -
/// how many `std::thread`s drain the job channel the Acceptor feeds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig { worker_count: 4 }
    }
}

/// Top-level configuration for the `opcua-server` binary, loaded from a
/// TOML file named on argv. Mirrors `GameConfig::load` in the teacher
/// workspace: a plain `serdeconv::from_toml_file` call, `Default` giving
/// sane values for a quick local run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub workers: WorkerPoolConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            network: NetworkConfig::default(),
            workers: WorkerPoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("error loading server configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_network_values() {
        let config = ServerConfig::default();
        assert_eq!(config.network.port, 4840);
        assert!(config.workers.worker_count > 0);
    }
}
