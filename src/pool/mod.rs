//! Fixed-capacity descriptor pool.
//!
//! Every descriptor lives in a preallocated arena and is identified by its
//! index. An arena slot holds the 128-byte header, the private metadata
//! area and the data room, in that order. Free indices sit either in the
//! shared ring (a bounded lock-free MPMC queue, the only point of
//! cross-core contention) or in the private cache of one core. A descriptor
//! is free exactly when its reference count is zero.

mod arena;
mod cache;

pub use cache::{CacheStats, CoreCache};

use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering, fence};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use tracing::info;
use triomphe::Arc;

use crate::config::MempoolConfig;
use crate::errors::{Error, Result};
use crate::mbuf::{BufferIndex, Mbuf, MbufHeader, NO_NEXT};
use arena::Arena;

/// Maps virtual addresses of the arena to addresses a DMA engine can use.
///
/// Called once per descriptor while the pool is built; the result is stored
/// in the descriptor's `buf_iova`.
pub trait AddressTranslator {
    fn iova(&self, virt: *const u8) -> u64;
}

/// IOVA-as-VA: the device sees the process' virtual addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtualAddressing;

impl AddressTranslator for VirtualAddressing {
    fn iova(&self, virt: *const u8) -> u64 {
        virt as u64
    }
}

#[derive(Default)]
struct CoreSlot {
    claimed: AtomicBool,
    /// Last published length of the core's cache.
    cached: AtomicUsize,
}

pub(crate) struct PoolInner {
    id: u64,
    config: MempoolConfig,
    capacity: u32,
    ring: ArrayQueue<u32>,
    cores: Box<[CachePadded<CoreSlot>]>,
    arena: Arena,
}

// Headers are only written by the unique owner of a descriptor (refcount 1,
// or 0 while it sits in a free structure); shared owners read, and the
// reference count itself is atomic.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl PoolInner {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn header_ptr(&self, index: u32) -> *mut MbufHeader {
        assert!(index < self.capacity, "mbuf index {index} out of range");
        self.arena.slot(index as usize).cast()
    }

    /// First metadata slot of descriptor `index`, right after its header.
    #[inline]
    pub(crate) fn metadata_ptr(&self, index: u32) -> *mut u64 {
        unsafe { self.header_ptr(index).add(1).cast() }
    }

    #[inline]
    pub(crate) fn refcnt(&self, index: u32) -> &AtomicU16 {
        unsafe { &(*self.header_ptr(index)).refcnt }
    }

    /// Adds one reference to an in-flight descriptor.
    #[inline]
    pub(crate) fn acquire(&self, index: u32) -> Result<u16> {
        self.refcnt(index)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| match c {
                0 => None,
                c => c.checked_add(1),
            })
            .map(|prev| prev + 1)
            .map_err(|c| match c {
                0 => Error::UseAfterFree { index },
                _ => Error::RefcountOverflow { index },
            })
    }

    /// Drops one reference; `true` once the last one is gone.
    #[inline]
    fn put(&self, index: u32) -> Result<bool> {
        let prev = self
            .refcnt(index)
            .fetch_update(Ordering::Release, Ordering::Relaxed, |c| c.checked_sub(1))
            .map_err(|_| Error::DoubleFree { index })?;
        if prev == 1 {
            fence(Ordering::Acquire);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Drops one reference on the chain headed by `head`. When the head goes
    /// free, every following segment loses its reference too, and each
    /// segment whose count reaches zero is unlinked and passed to `sink`.
    pub(crate) fn release_chain(
        &self,
        head: u32,
        mut sink: impl FnMut(u32) -> Result<()>,
    ) -> Result<bool> {
        if !self.put(head)? {
            return Ok(false);
        }
        let mut cur = Some(head);
        while let Some(index) = cur {
            let hdr = self.header_ptr(index);
            cur = unsafe { (*hdr).next_index() };
            if index != head && !self.put(index)? {
                continue;
            }
            // SAFETY: the count is zero, this is the last owner
            unsafe {
                (*hdr).next = NO_NEXT;
                (*hdr).nb_segs = 1;
            }
            sink(index)?;
        }
        Ok(true)
    }

    /// Prepares a descriptor just taken off a free structure.
    #[inline]
    pub(crate) fn reset_for_alloc(&self, index: u32) {
        // SAFETY: an index popped from the ring or a cache has no other owner
        let hdr = unsafe { &mut *self.header_ptr(index) };
        debug_assert_eq!(*hdr.refcnt.get_mut(), 0);
        hdr.reset(self.config.headroom);
        *hdr.refcnt.get_mut() = 1;
    }

    #[inline]
    pub(crate) fn ring_push(&self, index: u32) -> Result<()> {
        // A full ring means more frees than descriptors.
        self.ring.push(index).map_err(|index| Error::DoubleFree { index })
    }

    #[inline]
    fn ring_pop(&self) -> Option<u32> {
        self.ring.pop()
    }
}

/// Handle to a buffer pool. Cloning is cheap; the arena lives until the last
/// pool handle, core cache and buffer are gone.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<PoolInner>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Result<Self> {
        Self::with_translator(config, &VirtualAddressing)
    }

    pub fn with_translator(
        config: MempoolConfig,
        translator: &impl AddressTranslator,
    ) -> Result<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        config.validate()?;
        let capacity = config.capacity as usize;
        let arena = Arena::new(capacity, config.slot_stride(), config.align, config.pin_memory)?;
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        let header_room = config.header_room();
        let priv_size = config.priv_size() as u16;
        debug_assert!(mem::size_of::<MbufHeader>() + priv_size as usize <= header_room);
        for i in 0..capacity {
            let slot = arena.slot(i);
            // SAFETY: the slot is aligned for a header and has room for
            // header, metadata and data room
            unsafe {
                let buf_addr = slot.add(header_room);
                let hdr = MbufHeader::new(
                    buf_addr,
                    translator.iova(buf_addr),
                    config.data_room_size,
                    priv_size,
                    id,
                );
                ptr::write(slot.cast::<MbufHeader>(), hdr);
            }
        }

        let ring = ArrayQueue::new(capacity);
        for i in 0..config.capacity {
            ring.push(i).map_err(|_| Error::NoMemory)?;
        }

        let cores = (0..config.cores)
            .map(|_| CachePadded::new(CoreSlot::default()))
            .collect();

        info!(
            pool = %config.name,
            id,
            capacity,
            cache_size = config.cache_size,
            metadata_slots = config.metadata_slots,
            cores = config.cores,
            numa_node = ?config.numa_node,
            pinned = arena.is_pinned(),
            arena_bytes = arena.len(),
            "mempool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                capacity: config.capacity,
                config,
                ring,
                cores,
                arena,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.inner.config
    }

    pub fn numa_node(&self) -> Option<u32> {
        self.inner.config.numa_node
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity as usize
    }

    /// Free descriptors in the shared ring.
    pub fn shared_available(&self) -> usize {
        self.inner.ring.len()
    }

    /// Free descriptors in the shared ring and all core caches. Approximate
    /// under concurrent use.
    pub fn available(&self) -> usize {
        let cached: usize = self
            .inner
            .cores
            .iter()
            .map(|slot| slot.cached.load(Ordering::Relaxed))
            .sum();
        (self.shared_available() + cached).min(self.capacity())
    }

    pub fn in_use(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }

    /// Checks out the private cache of `core`. A core's cache has at most one
    /// owner at a time.
    pub fn core_cache(&self, core: usize) -> Result<CoreCache> {
        CoreCache::checkout(self.inner.clone(), core)
    }

    /// Takes a descriptor straight from the shared ring. Meant for control
    /// paths that run outside any worker core.
    pub fn allocate_uncached(&self) -> Result<Mbuf> {
        let index = self
            .inner
            .ring_pop()
            .ok_or(Error::PoolExhausted { pool_id: self.inner.id })?;
        self.inner.reset_for_alloc(index);
        Ok(Mbuf::from_parts(self.inner.clone(), index))
    }

    /// Rebuilds a handle from an index produced by [`Mbuf::into_raw`].
    ///
    /// # Safety
    ///
    /// `index` must carry a reference given up by `into_raw` on a buffer of
    /// this pool, and must be turned back into a handle only once.
    pub unsafe fn from_raw(&self, index: BufferIndex) -> Result<Mbuf> {
        let index = u32::from(index);
        if index as usize >= self.capacity() {
            return Err(Error::InvalidIndex { index });
        }
        if self.inner.refcnt(index).load(Ordering::Acquire) == 0 {
            return Err(Error::UseAfterFree { index });
        }
        Ok(Mbuf::from_parts(self.inner.clone(), index))
    }
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}
