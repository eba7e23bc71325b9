//! Node wiring and the capability surface the RPC layer consumes.
//!
//! The RPC transport itself lives outside this crate; everything it can do
//! is a typed method here. All integer inputs are range-checked by the
//! caller-facing methods and failures come back as structured errors, never
//! panics.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::block::BlockHeader;
use crate::chain::chainstate::ChainTipInfo;
use crate::chain::Chainstate;
use crate::config::NodeConfig;
use crate::consensus::pow::RandomxEngine;
use crate::consensus::validation::ValidationError;
use crate::consensus::{ConsensusParams, Network};
use crate::net::message::Message;
use crate::net::NetworkManager;
use crate::notifications::NotificationHub;
use crate::primitives::{Hash160, Hash256, U256};
use crate::time::Clock;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("not found")]
    NotFound,
    #[error("{0} is only available on {1}")]
    WrongNetwork(&'static str, &'static str),
    #[error("chain error: {0}")]
    Chain(String),
}

/// `getinfo` view.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub version: &'static str,
    pub network: Network,
    pub height: u64,
    pub best_hash: Option<Hash256>,
    pub chain_work: U256,
    pub peer_count: usize,
    pub in_initial_block_download: bool,
    pub orphan_count: usize,
    pub header_count: usize,
}

/// One row of `getpeerinfo`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: u64,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub connection_type: String,
    pub ready: bool,
    pub user_agent: String,
    pub start_height: Option<i32>,
    pub connected_at: u64,
    pub last_send: u64,
    pub last_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub ping_time_ms: u64,
    pub misbehavior_score: u32,
}

/// `getnetworkinfo` view.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub listen_enabled: bool,
    pub listen_port: u16,
    pub inbound_count: usize,
    pub outbound_count: usize,
    pub address_book_size: usize,
    pub ban_count: usize,
}

pub struct Node {
    config: NodeConfig,
    params: ConsensusParams,
    clock: Arc<Clock>,
    hub: Arc<NotificationHub>,
    engine: Arc<RandomxEngine>,
    pub chain: Arc<Chainstate>,
    pub network: Arc<NetworkManager>,
}

impl Node {
    pub fn new(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        let datadir = config.network_datadir();
        std::fs::create_dir_all(&datadir)?;

        let params = ConsensusParams::for_network(config.network);
        let clock = Arc::new(Clock::new());
        let hub = NotificationHub::new();
        let engine = Arc::new(RandomxEngine::new(
            &params,
            config.randomx_fast_mode,
            config.randomx_vm_cache_size,
        ));
        let chain = Arc::new(Chainstate::new(
            params.clone(),
            config.chainstate_config(),
            engine.clone(),
            hub.clone(),
            clock.clone(),
        ));

        match chain.load_snapshot(&datadir.join("chainstate.json")) {
            Ok(true) => info!(target: "node", "chain snapshot loaded"),
            Ok(false) => {}
            Err(e) => return Err(anyhow::anyhow!("chain snapshot: {e}")),
        }
        chain
            .initialize()
            .map_err(|e| anyhow::anyhow!("chainstate init: {e}"))?;

        let network = NetworkManager::new(
            config.network_config(),
            chain.clone(),
            clock.clone(),
            hub.clone(),
        );

        Ok(Arc::new(Node {
            config,
            params,
            clock,
            hub,
            engine,
            chain,
            network,
        }))
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        info!(target: "node", network = %self.config.network, datadir = %self.config.network_datadir().display(),
              "starting node");
        self.network.start().await
    }

    /// The `stop` verb and the Ctrl-C path: stop networking, persist state.
    pub fn stop(&self) {
        info!(target: "node", "shutting down");
        self.network.stop();
        let path = self.config.network_datadir().join("chainstate.json");
        if let Err(e) = self.chain.save_snapshot(&path) {
            tracing::error!(target: "node", error = %e, "failed to save chain snapshot");
        }
    }

    // ---- query verbs ----------------------------------------------------

    pub fn get_info(&self) -> NodeInfo {
        let tip = self.chain.tip();
        NodeInfo {
            version: env!("CARGO_PKG_VERSION"),
            network: self.config.network,
            height: tip.map(|t| t.height).unwrap_or(0),
            best_hash: tip.map(|t| t.hash),
            chain_work: tip.map(|t| t.chain_work).unwrap_or(U256::ZERO),
            peer_count: self.network.peers.peer_count(),
            in_initial_block_download: self.chain.is_initial_block_download(),
            orphan_count: self.chain.orphan_count(),
            header_count: self.chain.index_size(),
        }
    }

    pub fn get_block_count(&self) -> u64 {
        self.chain.block_count()
    }

    pub fn get_block_hash(&self, height: u64) -> Result<Hash256, RpcError> {
        self.chain.block_hash_at(height).ok_or_else(|| {
            RpcError::InvalidParameter(format!(
                "height {height} is beyond the tip ({})",
                self.chain.block_count()
            ))
        })
    }

    pub fn get_block_header(
        &self,
        hash: &Hash256,
    ) -> Result<(BlockHeader, u64, U256, bool), RpcError> {
        self.chain.header_info(hash).ok_or(RpcError::NotFound)
    }

    pub fn get_chain_tips(&self) -> Vec<ChainTipInfo> {
        self.chain.chain_tips()
    }

    pub fn get_network_hashps(&self, blocks: u64) -> Result<f64, RpcError> {
        if blocks == 0 || blocks > 1_000_000 {
            return Err(RpcError::InvalidParameter(
                "window must be between 1 and 1000000 blocks".into(),
            ));
        }
        Ok(self.chain.network_hashps(blocks))
    }

    pub fn get_peer_info(&self) -> Vec<PeerInfo> {
        let mut out = Vec::new();
        self.network.peers.for_each(|peer| {
            let version = peer.version_info();
            out.push(PeerInfo {
                id: peer.id,
                addr: peer.addr,
                inbound: !peer.conn_type.is_outbound(),
                connection_type: format!("{:?}", peer.conn_type),
                ready: peer.is_ready(),
                user_agent: version
                    .as_ref()
                    .map(|v| v.user_agent.clone())
                    .unwrap_or_default(),
                start_height: version.as_ref().map(|v| v.start_height),
                connected_at: peer.stats.connected_at,
                last_send: peer.stats.last_send.load(Ordering::Relaxed),
                last_recv: peer.stats.last_recv.load(Ordering::Relaxed),
                bytes_sent: peer.stats.bytes_sent.load(Ordering::Relaxed),
                bytes_recv: peer.stats.bytes_recv.load(Ordering::Relaxed),
                ping_time_ms: peer.stats.ping_time_ms.load(Ordering::Relaxed),
                misbehavior_score: peer.misbehavior.load(Ordering::Relaxed),
            });
        });
        out.sort_by_key(|p| p.id);
        out
    }

    pub fn get_network_info(&self) -> NetworkInfo {
        NetworkInfo {
            listen_enabled: self.config.listen_enabled,
            listen_port: self.config.effective_port(),
            inbound_count: self.network.peers.inbound_count(),
            outbound_count: self.network.peers.outbound_count(),
            address_book_size: self.network.addr_book_size(),
            ban_count: self.network.peers.list_bans().len(),
        }
    }

    // ---- command verbs --------------------------------------------------

    /// Sends a keepalive ping to every ready peer now.
    pub fn ping(&self) {
        self.network.peers.for_each(|peer| {
            if peer.is_ready() {
                let nonce: u64 = rand::random::<u64>() | 1;
                peer.stats.ping_nonce.store(nonce, Ordering::Relaxed);
                peer.stats
                    .last_ping_sent
                    .store(self.clock.now(), Ordering::Relaxed);
                peer.send(Message::Ping(nonce));
            }
        });
    }

    pub fn add_node(&self, addr: &str) -> Result<(), RpcError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| RpcError::InvalidParameter(format!("bad address: {addr}")))?;
        self.network.add_manual_peer(addr);
        Ok(())
    }

    pub fn disconnect_node(&self, addr: &str) -> Result<usize, RpcError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| RpcError::InvalidParameter(format!("bad address: {addr}")))?;
        let n = self.network.disconnect_by_addr(&addr);
        if n == 0 {
            return Err(RpcError::NotFound);
        }
        Ok(n)
    }

    pub fn set_ban(&self, ip: &str, duration_secs: u64, reason: &str) -> Result<(), RpcError> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| RpcError::InvalidParameter(format!("bad ip: {ip}")))?;
        let until = self.clock.now().saturating_add(duration_secs.max(1));
        self.network.peers.set_ban(ip, until, reason.to_string());
        Ok(())
    }

    pub fn list_bans(&self) -> Vec<crate::net::peer_manager::BanEntry> {
        self.network.peers.list_bans()
    }

    pub fn clear_bans(&self) {
        self.network.peers.clear_bans();
    }

    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), RpcError> {
        self.chain
            .invalidate_block(hash)
            .map_err(|e| RpcError::Chain(e.to_string()))
    }

    /// Regtest-only: mine `count` blocks to `miner` through the normal
    /// acceptance path.
    pub fn generate(&self, count: u64, miner: Hash160) -> Result<Vec<Hash256>, RpcError> {
        if self.config.network != Network::Regtest {
            return Err(RpcError::WrongNetwork("generate", "regtest"));
        }
        if count == 0 || count > 10_000 {
            return Err(RpcError::InvalidParameter(
                "count must be between 1 and 10000".into(),
            ));
        }
        let mut mined = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let hash = self.mine_one(miner).map_err(|e| RpcError::Chain(e.to_string()))?;
            mined.push(hash);
        }
        Ok(mined)
    }

    fn mine_one(&self, miner: Hash160) -> Result<Hash256, ValidationError> {
        let mut header = self.chain.build_block_template(miner)?;
        let target = crate::consensus::validation::decode_target(header.bits, &self.params)?;

        // Grind: the RandomX output must meet the target, and so must the
        // commitment that binds it into the header.
        const MAX_NONCE_TRIES: u32 = 1 << 22;
        for nonce in 0..MAX_NONCE_TRIES {
            header.nonce = nonce;
            let randomx_hash = self.engine.mining_hash(&header)?;
            if randomx_hash.to_u256() >= target {
                continue;
            }
            if header.commitment_hash(&randomx_hash).to_u256() >= target {
                continue;
            }
            header.randomx_hash = randomx_hash;
            let accepted = self.chain.accept_header(header, None)?;
            self.chain
                .activate_best_chain(None)
                .map_err(|e| ValidationError::Internal(e.to_string()))?;
            info!(target: "node", hash = %accepted.hash, height = accepted.height, "block mined");
            return Ok(accepted.hash);
        }
        Err(ValidationError::Internal(
            "nonce space exhausted for this template".into(),
        ))
    }

    /// Non-mainnet only: pins (or with 0 clears) the clock.
    pub fn set_mock_time(&self, time: u64) -> Result<(), RpcError> {
        if self.config.network == Network::Main {
            return Err(RpcError::WrongNetwork("setmocktime", "test networks"));
        }
        self.clock.set_mock_time(time);
        Ok(())
    }

    /// Blocks until Ctrl-C, then shuts down cleanly.
    pub async fn run_until_shutdown(self: &Arc<Self>) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!(target: "node", "interrupt received");
        self.stop();
        Ok(())
    }
}
