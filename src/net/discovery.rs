//! Address discovery: the tried/new address book, DNS seed bootstrap,
//! feeler scheduling, and anchor persistence.
//!
//! The book holds two tables. `tried` is addresses we have completed a
//! handshake with; `new` is everything merely heard about. Outbound
//! selection draws 50/50 between them; feelers always probe `new`.
//! Stale entries and repeat offenders age out during maintenance.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

/// Addresses unseen for this long are dropped.
pub const ADDR_STALE_SECS: u64 = 30 * 24 * 3600;

/// Addresses that failed this many attempts are dropped.
pub const ADDR_MAX_FAILURES: u32 = 10;

/// At most this many anchors are persisted or loaded.
pub const MAX_ANCHORS: usize = 3;

/// Mean delay between feeler connections.
pub const FEELER_INTERVAL_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub addr: SocketAddr,
    pub services: u64,
    pub last_seen: u64,
    pub last_attempt: u64,
    pub failures: u32,
}

#[derive(Default)]
pub struct AddrBook {
    tried: HashMap<SocketAddr, AddrInfo>,
    new: HashMap<SocketAddr, AddrInfo>,
}

impl AddrBook {
    pub fn new() -> Self {
        AddrBook::default()
    }

    pub fn len(&self) -> usize {
        self.tried.len() + self.new.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tried_len(&self) -> usize {
        self.tried.len()
    }

    pub fn new_len(&self) -> usize {
        self.new.len()
    }

    /// Records a heard-about address. Addresses already `tried` only get
    /// their last-seen refreshed.
    pub fn add(&mut self, addr: SocketAddr, services: u64, now: u64) {
        if let Some(existing) = self.tried.get_mut(&addr) {
            existing.last_seen = existing.last_seen.max(now);
            return;
        }
        self.new
            .entry(addr)
            .and_modify(|e| {
                e.last_seen = e.last_seen.max(now);
                e.services |= services;
            })
            .or_insert(AddrInfo {
                addr,
                services,
                last_seen: now,
                last_attempt: 0,
                failures: 0,
            });
    }

    pub fn mark_attempt(&mut self, addr: &SocketAddr, now: u64) {
        for table in [&mut self.tried, &mut self.new] {
            if let Some(info) = table.get_mut(addr) {
                info.last_attempt = now;
            }
        }
    }

    /// A completed handshake moves the address into `tried`.
    pub fn mark_success(&mut self, addr: &SocketAddr, now: u64) {
        let mut info = self
            .new
            .remove(addr)
            .or_else(|| self.tried.remove(addr))
            .unwrap_or(AddrInfo {
                addr: *addr,
                services: 0,
                last_seen: now,
                last_attempt: now,
                failures: 0,
            });
        info.last_seen = now;
        info.failures = 0;
        self.tried.insert(*addr, info);
    }

    pub fn mark_failure(&mut self, addr: &SocketAddr) {
        for table in [&mut self.tried, &mut self.new] {
            if let Some(info) = table.get_mut(addr) {
                info.failures += 1;
            }
        }
    }

    /// 50/50 between tried and new, skipping anything in `exclude` and
    /// anything attempted in the last minute.
    pub fn select<R: Rng>(
        &self,
        rng: &mut R,
        exclude: &dyn Fn(&SocketAddr) -> bool,
        now: u64,
    ) -> Option<SocketAddr> {
        let pick_from = |table: &HashMap<SocketAddr, AddrInfo>, rng: &mut R| {
            let eligible: Vec<&AddrInfo> = table
                .values()
                .filter(|i| !exclude(&i.addr))
                .filter(|i| now.saturating_sub(i.last_attempt) > 60)
                .collect();
            eligible.choose(rng).map(|i| i.addr)
        };
        let try_tried_first = rng.gen_bool(0.5);
        let (first, second) = if try_tried_first {
            (&self.tried, &self.new)
        } else {
            (&self.new, &self.tried)
        };
        pick_from(first, rng).or_else(|| pick_from(second, rng))
    }

    /// A random `new` address for a feeler probe.
    pub fn select_feeler<R: Rng>(&self, rng: &mut R) -> Option<SocketAddr> {
        let candidates: Vec<&AddrInfo> = self.new.values().collect();
        candidates.choose(rng).map(|i| i.addr)
    }

    /// Random sample for a GETADDR reply.
    pub fn sample<R: Rng>(&self, rng: &mut R, max: usize) -> Vec<AddrInfo> {
        let mut all: Vec<AddrInfo> = self
            .tried
            .values()
            .chain(self.new.values())
            .cloned()
            .collect();
        all.shuffle(rng);
        all.truncate(max);
        all
    }

    /// Ages out stale and repeatedly-failing addresses.
    pub fn cleanup(&mut self, now: u64) -> usize {
        let before = self.len();
        let keep = |info: &AddrInfo| {
            now.saturating_sub(info.last_seen) < ADDR_STALE_SECS
                && info.failures < ADDR_MAX_FAILURES
        };
        self.tried.retain(|_, info| keep(info));
        self.new.retain(|_, info| keep(info));
        let dropped = before - self.len();
        if dropped > 0 {
            debug!(target: "p2p", dropped, "address book cleanup");
        }
        dropped
    }
}

// ---- DNS seeds -----------------------------------------------------------

/// Resolves the configured DNS seeds; used only when the book is empty at
/// startup.
pub async fn bootstrap_dns_seeds(seeds: &[&str], port: u16) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for seed in seeds {
        match tokio::net::lookup_host((*seed, port)).await {
            Ok(addrs) => {
                let found: Vec<SocketAddr> = addrs.collect();
                info!(target: "p2p", seed, count = found.len(), "dns seed resolved");
                out.extend(found);
            }
            Err(e) => {
                debug!(target: "p2p", seed, error = %e, "dns seed lookup failed");
            }
        }
    }
    out
}

// ---- anchors -------------------------------------------------------------

/// Persists up to [`MAX_ANCHORS`] anchor addresses, one per network group.
pub fn save_anchors(path: &Path, anchors: &[SocketAddr]) -> std::io::Result<()> {
    use crate::net::peer_manager::net_group;
    let mut groups = std::collections::HashSet::new();
    let filtered: Vec<String> = anchors
        .iter()
        .filter(|a| groups.insert(net_group(&a.ip())))
        .take(MAX_ANCHORS)
        .map(|a| a.to_string())
        .collect();
    let json = serde_json::to_vec_pretty(&filtered)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    fs::write(path, json)
}

/// Loads anchors saved by a previous run; the file is consumed so a
/// crash-loop cannot redial the same two peers forever.
pub fn load_anchors(path: &Path) -> Vec<SocketAddr> {
    let Ok(bytes) = fs::read(path) else {
        return Vec::new();
    };
    let _ = fs::remove_file(path);
    let Ok(strings) = serde_json::from_slice::<Vec<String>>(&bytes) else {
        return Vec::new();
    };
    strings
        .iter()
        .filter_map(|s| s.parse().ok())
        .take(MAX_ANCHORS)
        .collect()
}

// ---- feeler jitter -------------------------------------------------------

/// Exponentially distributed delay around `mean`, so feeler timing leaks no
/// topology.
pub fn feeler_delay<R: Rng>(rng: &mut R, mean: Duration) -> Duration {
    let u: f64 = rng.gen_range(f64::EPSILON..1.0);
    let scaled = -u.ln() * mean.as_secs_f64();
    // Clamp to something sane on both ends.
    Duration::from_secs_f64(scaled.clamp(1.0, mean.as_secs_f64() * 10.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn addr(i: u8) -> SocketAddr {
        format!("10.0.0.{i}:7372").parse().unwrap()
    }

    #[test]
    fn add_and_promote_to_tried() {
        let mut book = AddrBook::new();
        book.add(addr(1), 1, 100);
        assert_eq!(book.new_len(), 1);
        assert_eq!(book.tried_len(), 0);

        book.mark_success(&addr(1), 200);
        assert_eq!(book.new_len(), 0);
        assert_eq!(book.tried_len(), 1);

        // Re-hearing about a tried address does not demote it.
        book.add(addr(1), 1, 300);
        assert_eq!(book.tried_len(), 1);
        assert_eq!(book.new_len(), 0);
    }

    #[test]
    fn selection_excludes_and_respects_recent_attempts() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut book = AddrBook::new();
        book.add(addr(1), 1, 100);
        book.add(addr(2), 1, 100);

        let exclude_one = |a: &SocketAddr| *a == addr(1);
        for _ in 0..20 {
            let picked = book.select(&mut rng, &exclude_one, 1_000).unwrap();
            assert_eq!(picked, addr(2));
        }

        // A just-attempted address is skipped.
        book.mark_attempt(&addr(2), 1_000);
        assert!(book.select(&mut rng, &exclude_one, 1_010).is_none());
        assert!(book.select(&mut rng, &exclude_one, 1_100).is_some());
    }

    #[test]
    fn cleanup_drops_stale_and_failing() {
        let mut book = AddrBook::new();
        book.add(addr(1), 1, 0);
        book.add(addr(2), 1, 1_000_000);
        for _ in 0..ADDR_MAX_FAILURES {
            book.mark_failure(&addr(2));
        }
        book.add(addr(3), 1, 1_000_000);
        let dropped = book.cleanup(ADDR_STALE_SECS + 10);
        assert_eq!(dropped, 2);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn feeler_picks_from_new_only() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut book = AddrBook::new();
        book.add(addr(1), 1, 100);
        book.mark_success(&addr(1), 100);
        assert!(book.select_feeler(&mut rng).is_none());
        book.add(addr(2), 1, 100);
        assert_eq!(book.select_feeler(&mut rng), Some(addr(2)));
    }

    #[test]
    fn sample_is_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut book = AddrBook::new();
        for i in 0..50 {
            book.add(addr(i), 1, 100);
        }
        assert_eq!(book.sample(&mut rng, 10).len(), 10);
        assert_eq!(book.sample(&mut rng, 100).len(), 50);
    }

    #[test]
    fn anchors_round_trip_and_consume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchors.json");
        let anchors = vec![
            "10.1.0.1:7372".parse().unwrap(),
            "10.1.0.2:7372".parse().unwrap(), // same /16 as the first
            "10.2.0.1:7372".parse().unwrap(),
            "10.3.0.1:7372".parse().unwrap(),
            "10.4.0.1:7372".parse().unwrap(),
        ];
        save_anchors(&path, &anchors).unwrap();
        let loaded = load_anchors(&path);
        // Distinct /16 filter plus the cap.
        assert_eq!(loaded.len(), MAX_ANCHORS);
        assert_eq!(loaded[0], anchors[0]);
        assert_eq!(loaded[1], anchors[2]);
        // The file is consumed on load.
        assert!(load_anchors(&path).is_empty());
    }

    #[test]
    fn feeler_delay_is_jittered_and_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let mean = Duration::from_secs(FEELER_INTERVAL_SECS);
        let mut distinct = std::collections::HashSet::new();
        for _ in 0..50 {
            let d = feeler_delay(&mut rng, mean);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= mean * 10);
            distinct.insert(d.as_millis());
        }
        assert!(distinct.len() > 10, "delays should vary");
    }
}
