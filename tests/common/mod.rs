//! Shared test harness: an in-process chainstate with a mocked clock, an
//! event recorder, and a real-PoW miner for regtest headers.
//!
//! Regtest uses one-second spacing; mining each child at `parent.time + 1`
//! keeps every block exactly on the retarget schedule, so the required bits
//! stay at the proof-of-work limit and tests control work purely through
//! chain length.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use ember_node::chain::{Chainstate, ChainstateConfig};
use ember_node::consensus::pow::RandomxEngine;
use ember_node::consensus::{ConsensusParams, Network};
use ember_node::notifications::{Event, NotificationHub, Subscription};
use ember_node::time::Clock;
use ember_node::{BlockHeader, Hash160, Hash256, U256};

pub struct Harness {
    pub params: ConsensusParams,
    pub engine: Arc<RandomxEngine>,
    pub clock: Arc<Clock>,
    pub hub: Arc<NotificationHub>,
    pub chain: Arc<Chainstate>,
    pub events: Arc<Mutex<Vec<Event>>>,
    _subscription: Subscription,
}

pub fn regtest_params() -> ConsensusParams {
    ConsensusParams::for_network(Network::Regtest)
}

pub fn harness() -> Harness {
    harness_with(ChainstateConfig::default(), regtest_params())
}

pub fn harness_with(config: ChainstateConfig, params: ConsensusParams) -> Harness {
    let engine = Arc::new(RandomxEngine::new(&params, false, 2));
    let clock = Arc::new(Clock::new());
    // Far enough ahead that test headers are never "too new", far enough
    // behind "recent" that the node stays in initial sync unless a test
    // moves the clock.
    clock.set_mock_time(params.genesis_header().time as u64 + 600_000);

    let hub = NotificationHub::new();
    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = events.clone();
    let subscription = hub.subscribe(move |event| {
        recorder.lock().push(event.clone());
    });

    let chain = Arc::new(Chainstate::new(
        params.clone(),
        config,
        engine.clone(),
        hub.clone(),
        clock.clone(),
    ));
    chain.initialize().expect("chainstate initializes");

    Harness {
        params,
        engine,
        clock,
        hub,
        chain,
        events,
        _subscription: subscription,
    }
}

impl Harness {
    pub fn genesis_hash(&self) -> Hash256 {
        self.params.genesis_hash()
    }

    pub fn genesis_time(&self) -> u32 {
        self.params.genesis_header().time
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.chain.tip().expect("tip exists").hash
    }

    pub fn tip_height(&self) -> u64 {
        self.chain.tip().expect("tip exists").height
    }

    pub fn events_of<F: Fn(&Event) -> bool>(&self, pred: F) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Mines one valid child header with real RandomX proof-of-work.
    /// `miner_salt` differentiates forks that share times and heights.
    pub fn mine_child(&self, prev_hash: Hash256, prev_time: u32, miner_salt: u8) -> BlockHeader {
        let mut header = BlockHeader {
            version: 1,
            prev_hash,
            miner_address: Hash160::new([miner_salt; 20]),
            time: prev_time + 1,
            bits: self.params.pow_limit_bits,
            nonce: 0,
            randomx_hash: Hash256::ZERO,
        };
        let target = U256::from_compact(header.bits).expect("regtest bits decode");
        loop {
            let randomx_hash = self
                .engine
                .mining_hash(&header)
                .expect("randomx is available in tests");
            if randomx_hash.to_u256() < target
                && header.commitment_hash(&randomx_hash).to_u256() < target
            {
                header.randomx_hash = randomx_hash;
                return header;
            }
            header.nonce += 1;
        }
    }

    /// Mines `count` chained headers starting after (`from_hash`, `from_time`).
    pub fn mine_chain(
        &self,
        from_hash: Hash256,
        from_time: u32,
        count: usize,
        miner_salt: u8,
    ) -> Vec<BlockHeader> {
        let mut headers = Vec::with_capacity(count);
        let mut prev_hash = from_hash;
        let mut prev_time = from_time;
        for _ in 0..count {
            let header = self.mine_child(prev_hash, prev_time, miner_salt);
            prev_hash = header.hash();
            prev_time = header.time;
            headers.push(header);
        }
        headers
    }

    /// Accepts headers through the normal pipeline and activates.
    pub fn accept_and_activate(&self, headers: &[BlockHeader], peer: Option<u64>) {
        let pre_batch = self.chain.tip().map(|t| t.hash);
        for header in headers {
            self.chain
                .accept_header(*header, peer)
                .unwrap_or_else(|e| panic!("header rejected: {e}"));
        }
        self.chain
            .activate_best_chain(pre_batch)
            .expect("activation succeeds");
    }
}
