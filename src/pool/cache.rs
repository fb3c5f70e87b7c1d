use std::sync::atomic::Ordering;

use arrayvec::ArrayVec;
use tracing::{debug, trace, warn};
use triomphe::Arc;

use super::PoolInner;
use crate::config::MAX_CACHE_SIZE;
use crate::errors::{Error, Result};
use crate::mbuf::Mbuf;

/// Room for a full cache plus the overshoot allowed before a flush.
const CACHE_CAPACITY: usize = MAX_CACHE_SIZE * 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub allocs: u64,
    pub alloc_failures: u64,
    pub releases: u64,
    /// Batches pulled from the shared ring.
    pub refills: u64,
    /// Batches pushed back to the shared ring.
    pub flushes: u64,
}

/// Private free list of one core.
///
/// Allocation and release touch only this stack on the fast path. When it
/// runs dry a batch is pulled from the shared ring; when it grows past the
/// flush threshold the excess goes back. Dropping the cache hands every
/// cached descriptor to the shared ring and frees the core slot.
pub struct CoreCache {
    pool: Arc<PoolInner>,
    core: usize,
    size: usize,
    flush_threshold: usize,
    objs: ArrayVec<u32, CACHE_CAPACITY>,
    stats: CacheStats,
}

impl CoreCache {
    pub(super) fn checkout(pool: Arc<PoolInner>, core: usize) -> Result<Self> {
        let cores = pool.cores.len();
        let slot = pool.cores.get(core).ok_or(Error::CoreOutOfRange { core, cores })?;
        if slot.claimed.swap(true, Ordering::Acquire) {
            return Err(Error::CoreInUse { core });
        }
        let size = pool.config.cache_size as usize;
        let flush_threshold = pool.config.flush_threshold();
        debug!(pool = pool.id, core, size, flush_threshold, "core cache checked out");
        Ok(Self {
            pool,
            core,
            size,
            flush_threshold,
            objs: ArrayVec::new(),
            stats: CacheStats::default(),
        })
    }

    pub fn core(&self) -> usize {
        self.core
    }

    /// Descriptors currently held by this cache.
    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[inline]
    pub fn allocate(&mut self) -> Result<Mbuf> {
        let index = match self.objs.pop() {
            Some(index) => index,
            None => self.refill()?,
        };
        self.publish();
        self.stats.allocs += 1;
        self.pool.reset_for_alloc(index);
        Ok(Mbuf::from_parts(self.pool.clone(), index))
    }

    #[cold]
    fn refill(&mut self) -> Result<u32> {
        while self.objs.len() < self.size {
            match self.pool.ring_pop() {
                Some(index) => self.objs.push(index),
                None => break,
            }
        }
        if !self.objs.is_empty() {
            self.stats.refills += 1;
            trace!(
                pool = self.pool.id,
                core = self.core,
                got = self.objs.len(),
                "cache refilled"
            );
        }
        match self.objs.pop() {
            Some(index) => Ok(index),
            // Uncached pools and a drained ring both end up here.
            None => match self.pool.ring_pop() {
                Some(index) => Ok(index),
                None => {
                    self.stats.alloc_failures += 1;
                    Err(Error::PoolExhausted { pool_id: self.pool.id })
                }
            },
        }
    }

    /// Allocates exactly `count` buffers into `out`, or none at all.
    pub fn allocate_bulk(&mut self, count: usize, out: &mut Vec<Mbuf>) -> Result<()> {
        out.reserve(count);
        let start = out.len();
        for _ in 0..count {
            match self.allocate() {
                Ok(mbuf) => out.push(mbuf),
                Err(err) => {
                    let taken = (out.len() - start) as u64;
                    let rollback = self.release_bulk(out.drain(start..));
                    self.stats.allocs -= taken;
                    self.stats.releases -= taken;
                    rollback?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Gives up one reference on `mbuf`. Segments that become free land in
    /// this cache.
    ///
    /// A buffer of another pool is still released, into its own pool's
    /// shared ring, and reported as [`Error::ForeignBuffer`].
    #[inline]
    pub fn release(&mut self, mbuf: Mbuf) -> Result<()> {
        let found = mbuf.pool_id();
        if found != self.pool.id {
            mbuf.release_reference()?;
            return Err(Error::ForeignBuffer {
                expected: self.pool.id,
                found,
            });
        }
        self.stats.releases += 1;
        let index = u32::from(mbuf.into_raw());

        let pool: &PoolInner = &self.pool;
        let (objs, stats) = (&mut self.objs, &mut self.stats);
        let (size, flush_threshold) = (self.size, self.flush_threshold);
        let res = pool.release_chain(index, |index| {
            stash(pool, objs, stats, size, flush_threshold, index)
        });
        self.publish();
        res.map(|_| ())
    }

    /// Releases every buffer, even past a failure, and returns the first
    /// error.
    pub fn release_bulk(&mut self, mbufs: impl IntoIterator<Item = Mbuf>) -> Result<()> {
        let mut first = Ok(());
        for mbuf in mbufs {
            let res = self.release(mbuf);
            if first.is_ok() {
                first = res;
            }
        }
        first
    }

    /// Returns every cached descriptor to the shared ring.
    pub fn flush(&mut self) -> Result<()> {
        let res = flush_down_to(&self.pool, &mut self.objs, &mut self.stats, 0);
        self.publish();
        res
    }

    #[inline]
    fn publish(&self) {
        self.pool.cores[self.core]
            .cached
            .store(self.objs.len(), Ordering::Relaxed);
    }
}

fn stash(
    pool: &PoolInner,
    objs: &mut ArrayVec<u32, CACHE_CAPACITY>,
    stats: &mut CacheStats,
    size: usize,
    flush_threshold: usize,
    index: u32,
) -> Result<()> {
    if size == 0 {
        return pool.ring_push(index);
    }
    objs.push(index);
    if objs.len() >= flush_threshold {
        flush_down_to(pool, objs, stats, size)?;
    }
    Ok(())
}

fn flush_down_to(
    pool: &PoolInner,
    objs: &mut ArrayVec<u32, CACHE_CAPACITY>,
    stats: &mut CacheStats,
    keep: usize,
) -> Result<()> {
    if objs.len() <= keep {
        return Ok(());
    }
    stats.flushes += 1;
    for index in objs.drain(keep..) {
        pool.ring_push(index)?;
    }
    Ok(())
}

impl Drop for CoreCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(pool = self.pool.id, core = self.core, %err, "core cache flush failed");
        }
        self.pool.cores[self.core].claimed.store(false, Ordering::Release);
        debug!(
            pool = self.pool.id,
            core = self.core,
            allocs = self.stats.allocs,
            releases = self.stats.releases,
            refills = self.stats.refills,
            flushes = self.stats.flushes,
            "core cache returned"
        );
    }
}
