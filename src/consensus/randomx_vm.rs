//! Epoch-keyed RandomX VM cache.
//!
//! RandomX needs a key-specific cache (and, in fast mode, a ~2 GiB dataset)
//! before it can hash. Rebuilding either per header would make verification
//! useless, so VMs are kept per epoch in an MRU list. The cache is owned by
//! one thread (callers hold it in a thread-local); capacity is at least two
//! so that headers straddling an epoch boundary do not thrash.

use randomx_rs::{RandomXCache, RandomXDataset, RandomXError, RandomXFlag, RandomXVM};
use tracing::{debug, info};

struct Entry {
    epoch: u64,
    vm: RandomXVM,
}

pub struct VmCache {
    flags: RandomXFlag,
    fast: bool,
    capacity: usize,
    /// Most recently used first.
    entries: Vec<Entry>,
}

impl VmCache {
    pub fn new(fast: bool, capacity: usize) -> Self {
        let mut flags = RandomXFlag::get_recommended_flags();
        if fast {
            flags |= RandomXFlag::FLAG_FULL_MEM;
        }
        VmCache {
            flags,
            fast,
            capacity: capacity.max(2),
            entries: Vec::new(),
        }
    }

    pub fn contains(&self, epoch: u64) -> bool {
        self.entries.iter().any(|e| e.epoch == epoch)
    }

    /// Hashes `input` with the VM for `epoch`, building the VM from `seed`
    /// on first use.
    pub fn hash(&mut self, epoch: u64, seed: &[u8; 32], input: &[u8]) -> Result<[u8; 32], RandomXError> {
        let vm = self.vm_for(epoch, seed)?;
        let digest = vm.calculate_hash(input)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    fn vm_for(&mut self, epoch: u64, seed: &[u8; 32]) -> Result<&mut RandomXVM, RandomXError> {
        if let Some(pos) = self.entries.iter().position(|e| e.epoch == epoch) {
            if pos != 0 {
                let entry = self.entries.remove(pos);
                self.entries.insert(0, entry);
            }
            return Ok(&mut self.entries[0].vm);
        }

        info!(target: "pow", epoch, fast = self.fast, "initializing RandomX VM");
        let cache = RandomXCache::new(self.flags, seed)?;
        let vm = if self.fast {
            let dataset = RandomXDataset::new(self.flags, cache.clone(), 0)?;
            RandomXVM::new(self.flags, Some(cache), Some(dataset))?
        } else {
            RandomXVM::new(self.flags, Some(cache), None)?
        };

        self.entries.insert(0, Entry { epoch, vm });
        if self.entries.len() > self.capacity {
            let evicted = self.entries.pop().map(|e| e.epoch);
            debug!(target: "pow", ?evicted, "evicted RandomX VM");
        }
        Ok(&mut self.entries[0].vm)
    }
}
