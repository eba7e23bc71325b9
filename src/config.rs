//! Process configuration.
//!
//! Defaults, then `EMBER_*` environment variables, then command-line flags
//! (applied in `main`). The recognized options are exactly the process-wide
//! knobs; consensus parameters never come from configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::chain::ChainstateConfig;
use crate::consensus::Network;
use crate::net::NetworkConfig;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: Network,
    /// 0 means "the network's default port".
    pub listen_port: u16,
    pub listen_enabled: bool,
    pub datadir: PathBuf,
    /// Worker threads for the tokio runtime; 0 picks the core count.
    pub io_threads: usize,
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub connect_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    /// Full-memory RandomX dataset (fast hashing, slow startup, ~2 GiB).
    pub randomx_fast_mode: bool,
    pub randomx_vm_cache_size: usize,
    pub suspicious_reorg_depth: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network: Network::Main,
            listen_port: 0,
            listen_enabled: true,
            datadir: PathBuf::from(".ember"),
            io_threads: 0,
            max_outbound: 8,
            max_inbound: 125,
            connect_interval_secs: 15,
            maintenance_interval_secs: 30,
            randomx_fast_mode: false,
            randomx_vm_cache_size: 2,
            suspicious_reorg_depth: 100,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        if let Ok(value) = raw.trim().parse() {
            *slot = value;
        }
    }
}

fn env_bool(key: &str, slot: &mut bool) {
    if let Ok(raw) = env::var(key) {
        let raw = raw.trim();
        *slot = raw == "1" || raw.eq_ignore_ascii_case("true");
    }
}

impl NodeConfig {
    /// Defaults overlaid with `EMBER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = NodeConfig::default();
        env_parse("EMBER_NETWORK", &mut config.network);
        env_parse("EMBER_PORT", &mut config.listen_port);
        env_bool("EMBER_LISTEN", &mut config.listen_enabled);
        if let Ok(dir) = env::var("EMBER_DATADIR") {
            if !dir.trim().is_empty() {
                config.datadir = PathBuf::from(dir.trim());
            }
        }
        env_parse("EMBER_IO_THREADS", &mut config.io_threads);
        env_parse("EMBER_MAX_OUTBOUND", &mut config.max_outbound);
        env_parse("EMBER_MAX_INBOUND", &mut config.max_inbound);
        env_parse("EMBER_CONNECT_INTERVAL", &mut config.connect_interval_secs);
        env_parse(
            "EMBER_MAINTENANCE_INTERVAL",
            &mut config.maintenance_interval_secs,
        );
        env_bool("EMBER_RANDOMX_FAST", &mut config.randomx_fast_mode);
        env_parse("EMBER_RANDOMX_VM_CACHE", &mut config.randomx_vm_cache_size);
        env_parse(
            "EMBER_SUSPICIOUS_REORG_DEPTH",
            &mut config.suspicious_reorg_depth,
        );
        config
    }

    pub fn effective_port(&self) -> u16 {
        if self.listen_port != 0 {
            self.listen_port
        } else {
            self.network.default_port()
        }
    }

    /// Per-network data directory (`<datadir>/<network>/`).
    pub fn network_datadir(&self) -> PathBuf {
        self.datadir.join(self.network.as_str())
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            network: self.network,
            listen_enabled: self.listen_enabled,
            listen_port: self.effective_port(),
            max_outbound: self.max_outbound,
            max_inbound: self.max_inbound,
            connect_interval: Duration::from_secs(self.connect_interval_secs.max(1)),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs.max(1)),
            datadir: self.network_datadir(),
        }
    }

    pub fn chainstate_config(&self) -> ChainstateConfig {
        ChainstateConfig {
            suspicious_reorg_depth: self.suspicious_reorg_depth.max(1),
            ..ChainstateConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_tracks_network() {
        let mut config = NodeConfig::default();
        assert_eq!(config.effective_port(), Network::Main.default_port());
        config.network = Network::Regtest;
        assert_eq!(config.effective_port(), Network::Regtest.default_port());
        config.listen_port = 9999;
        assert_eq!(config.effective_port(), 9999);
    }

    #[test]
    fn network_datadir_is_namespaced() {
        let mut config = NodeConfig::default();
        config.datadir = PathBuf::from("/tmp/ember");
        config.network = Network::Test;
        assert_eq!(config.network_datadir(), PathBuf::from("/tmp/ember/test"));
    }

    #[test]
    fn derived_configs_carry_settings() {
        let mut config = NodeConfig::default();
        config.network = Network::Regtest;
        config.max_outbound = 4;
        config.suspicious_reorg_depth = 5;
        let net = config.network_config();
        assert_eq!(net.max_outbound, 4);
        assert_eq!(net.network, Network::Regtest);
        assert_eq!(config.chainstate_config().suspicious_reorg_depth, 5);
    }
}
