use crate::storage::{Block, BLOCK_SIZE};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

#[cfg(test)]
use core::sync::atomic::AtomicU32;

const NO_TAG: u16 = 0xFFFF;

/**
The one sector the drive is currently spinning under the head.

 Ownership is handed back and forth through the ready flag: the main
 loop only writes the block while it is not ready, the read interrupt
 only looks at it while it is ready. Both run on the same core, and the
 interrupt never waits on the main loop, so one side is always done
 before the other touches the bytes.
*/
pub struct SectorCache {
    block: UnsafeCell<Block>,
    ready: AtomicBool,
    tag: AtomicU16,
    #[cfg(test)]
    pub reads: AtomicU32,
}

// SAFETY: see the handoff rules above. `fill` flips the flag before
// taking the mutable borrow and `byte` checks it before reading.
unsafe impl Sync for SectorCache {}

impl SectorCache {
    pub const fn new() -> Self {
        return SectorCache {
            block: UnsafeCell::new([0u8; BLOCK_SIZE]),
            ready: AtomicBool::new(false),
            tag: AtomicU16::new(NO_TAG),
            #[cfg(test)]
            reads: AtomicU32::new(0),
        };
    }

    pub fn is_ready(&self) -> bool {
        return self.ready.load(Ordering::Acquire);
    }

    /// (disk track, sector) of the last fill, ready or not.
    pub fn tag(&self) -> Option<(u8, u8)> {
        let tag = self.tag.load(Ordering::Relaxed);
        if tag == NO_TAG {
            return None;
        }
        return Some(((tag >> 8) as u8, tag as u8));
    }

    /// Stop trusting the contents. The read side goes idle.
    pub fn invalidate(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Forget the contents entirely, tag included.
    pub fn clear(&self) {
        self.invalidate();
        self.tag.store(NO_TAG, Ordering::Relaxed);
    }

    /**
    Overwrite the block for (track, sector). Must only be called from
     the main loop. The cache is invalidated first and stays so; the
     caller marks it ready once the data has really landed.
    */
    pub fn fill<R>(&self, track: u8, sector: u8, f: impl FnOnce(&mut Block) -> R) -> R {
        self.invalidate();
        self.tag.store(((track as u16) << 8) | sector as u16, Ordering::Relaxed);
        // SAFETY: not ready, so the interrupt side will not read it.
        let block = unsafe { &mut *self.block.get() };
        return f(block);
    }

    pub fn mark_ready(&self) {
        if self.tag().is_some() {
            self.ready.store(true, Ordering::Release);
        }
    }

    /// Byte `index` of the block, only while the cache is trusted.
    pub fn byte(&self, index: usize) -> Option<u8> {
        if !self.is_ready() || index >= BLOCK_SIZE {
            return None;
        }

        #[cfg(test)]
        self.reads.fetch_add(1, Ordering::Relaxed);

        // SAFETY: ready, so the main loop is not writing.
        let block = unsafe { &*self.block.get() };
        return Some(block[index]);
    }
}

impl Default for SectorCache {
    fn default() -> Self {
        return Self::new();
    }
}

#[cfg(test)]
mod test_cache {
    use super::*;

    #[test]
    fn unready_cache_reads_nothing() {
        let cache = SectorCache::new();
        assert_eq!(cache.byte(0), None);
        assert_eq!(cache.tag(), None);

        // Nothing filled yet, so it cannot be trusted
        cache.mark_ready();
        assert!(!cache.is_ready());
    }

    #[test]
    fn fill_then_ready() {
        let cache = SectorCache::new();
        cache.fill(3, 9, |block| {
            block[0] = 0xD5;
            block[511] = 0xEB;
        });
        assert_eq!(cache.tag(), Some((3, 9)));
        assert_eq!(cache.byte(0), None);

        cache.mark_ready();
        assert_eq!(cache.byte(0), Some(0xD5));
        assert_eq!(cache.byte(511), Some(0xEB));
        assert_eq!(cache.byte(512), None);
        assert_eq!(cache.reads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn refill_invalidates() {
        let cache = SectorCache::new();
        cache.fill(0, 0, |_| ());
        cache.mark_ready();
        cache.fill(0, 1, |block| {
            assert!(!cache.is_ready());
            block[0] = 1;
        });
        assert!(!cache.is_ready());

        cache.clear();
        assert_eq!(cache.tag(), None);
    }
}
