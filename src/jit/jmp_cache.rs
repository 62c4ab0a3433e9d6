//! Process-wide jump cache.
//!
//! Maps guest addresses to the generated code translated for them, so the
//! indirect-jump path can re-enter translated code without calling the
//! translator. The table is direct-mapped on the low 16 bits of the guest
//! address; a newer insert into an occupied slot replaces the older entry.
//!
//! Keys are stored mangled: `addr + cache_mangle(addr) - 1 == 0`, which lets
//! the generated probe test for a hit with `lea` + `jecxz` and leave the
//! guest flags untouched. Each slot is a single 64-bit word holding the
//! mangled key in its low half and the generated address in its high half,
//! so lookups never see a key paired with another entry's address.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use serde::Serialize;

use crate::vm::ThreadContext;

/// Number of slots.
pub const JMP_CACHE_SIZE: usize = 0x1_0000;

/// Slot index for a guest address.
pub fn hash_index(addr: u32) -> usize {
    (addr & 0xffff) as usize
}

/// Mangled form of a guest address.
pub fn cache_mangle(addr: u32) -> u32 {
    1u32.wrapping_sub(addr)
}

fn pack(addr: u32, jit_addr: u32) -> u64 {
    (u64::from(jit_addr) << 32) | u64::from(cache_mangle(addr))
}

/// Guest address and generated address of a live slot word.
fn unpack(word: u64) -> Option<(u32, u32)> {
    let jit_addr = (word >> 32) as u32;
    if jit_addr == 0 {
        return None;
    }
    Some((cache_mangle(word as u32), jit_addr))
}

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    /// Entries removed by a colliding insert or an invalidation.
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of [`JumpCache::invalidate_range`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Invalidation {
    /// Cache entries removed.
    pub evicted: usize,
    /// Whether the context's resident fragment overlapped the range.
    pub fragment_dropped: bool,
}

/// Direct-mapped guest → generated address table.
pub struct JumpCache {
    slots: Box<[AtomicU64]>,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl Default for JumpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl JumpCache {
    pub fn new() -> Self {
        Self {
            slots: (0..JMP_CACHE_SIZE).map(|_| AtomicU64::new(0)).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// The cache shared by every thread of the process.
    pub fn global() -> &'static JumpCache {
        static CACHE: OnceLock<JumpCache> = OnceLock::new();
        CACHE.get_or_init(JumpCache::new)
    }

    /// Record that `addr` is translated at `jit_addr`.
    ///
    /// A generated address of 0 marks an empty slot, so inserting it removes
    /// whatever the slot held.
    pub fn insert(&self, addr: u32, jit_addr: u32) {
        let word = if jit_addr == 0 { 0 } else { pack(addr, jit_addr) };
        let old = self.slots[hash_index(addr)].swap(word, Ordering::AcqRel);
        if jit_addr != 0 {
            self.insertions.fetch_add(1, Ordering::Relaxed);
        }
        if let Some((old_addr, _)) = unpack(old) {
            if old_addr != addr || jit_addr == 0 {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Generated address for `addr`, if cached.
    pub fn lookup(&self, addr: u32) -> Option<u32> {
        let word = self.slots[hash_index(addr)].load(Ordering::Acquire);
        match unpack(word) {
            Some((key, jit_addr)) if key == addr => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(jit_addr)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Drop every entry whose guest address lies in `[addr, addr + len)`.
    /// Returns the number of entries removed.
    pub fn evict_range(&self, addr: u32, len: u32) -> usize {
        if len == 0 {
            return 0;
        }
        let in_range = |a: u32| a.wrapping_sub(addr) < len;
        let mut evicted = 0;

        let mut evict_slot = |slot: &AtomicU64| {
            let word = slot.load(Ordering::Acquire);
            if let Some((key, _)) = unpack(word) {
                // lost races mean someone else replaced the entry already
                if in_range(key)
                    && slot
                        .compare_exchange(word, 0, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                {
                    evicted += 1;
                }
            }
        };

        if len as usize >= JMP_CACHE_SIZE {
            self.slots.iter().for_each(&mut evict_slot);
        } else {
            for i in 0..len {
                evict_slot(&self.slots[hash_index(addr.wrapping_add(i))]);
            }
        }

        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Invalidate guest code in `[addr, addr + len)` after it may have changed.
    ///
    /// Removes the matching cache entries and discards `ctx`'s resident
    /// fragment if it was translated from the range. Other threads' fragments
    /// are their own business.
    pub fn invalidate_range(&self, ctx: &mut ThreadContext, addr: u32, len: u32) -> Invalidation {
        let evicted = self.evict_range(addr, len);
        let fragment_dropped = ctx.forget_fragment_in(addr, len);
        debug!(
            "invalidate {:#x}+{:#x}: {} entries, fragment dropped: {}",
            addr, len, evicted, fragment_dropped
        );
        Invalidation {
            evicted,
            fragment_dropped,
        }
    }

    /// Empty the whole table.
    pub fn clear(&self) {
        let mut evicted = 0;
        for slot in self.slots.iter() {
            if unpack(slot.swap(0, Ordering::AcqRel)).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| unpack(s.load(Ordering::Relaxed)).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Base of the slot array for generated probe code. On a little-endian
    /// host each slot reads as a `{ mangled, jit_addr }` pair of 32-bit words.
    pub fn as_ptr(&self) -> *const AtomicU64 {
        self.slots.as_ptr()
    }
}
