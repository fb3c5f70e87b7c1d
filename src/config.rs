//! Mempool construction parameters.
//!
//! A pool is sized once at startup and never reconfigured. The values can be
//! built in code, read from a TOML table or overridden from the command line.

use std::fs;
use std::mem;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::errors::{Error, Result};
use crate::mbuf::MbufHeader;

pub const CACHE_LINE_SIZE: usize = 64;
pub const DEFAULT_NAME: &str = "pktmbuf";
pub const DEFAULT_CAPACITY: u32 = 2048;
pub const DEFAULT_CACHE_SIZE: u32 = 32;
pub const DEFAULT_HEADROOM: u16 = 128;
pub const DEFAULT_DATA_ROOM_SIZE: u16 = 2048 + DEFAULT_HEADROOM;
pub const DEFAULT_METADATA_SLOTS: u16 = 16;
/// Width of one metadata slot in bytes.
pub const METADATA_SLOT_SIZE: usize = 8;
/// Upper bound of a per-core cache, in descriptors.
pub const MAX_CACHE_SIZE: usize = 512;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MempoolConfig {
    pub name: String,
    /// Total number of descriptors.
    pub capacity: u32,
    /// Per-core cache size. Zero disables caching.
    pub cache_size: u32,
    /// Bytes of backing memory per descriptor, headroom included.
    pub data_room_size: u16,
    /// Bytes reserved in front of the packet data after a reset.
    pub headroom: u16,
    /// 64-bit private metadata words stored between each header and its data
    /// room.
    pub metadata_slots: u16,
    /// Alignment of each data room. Power of two, at least a cache line.
    pub align: usize,
    pub numa_node: Option<u32>,
    /// Number of per-core caches.
    pub cores: usize,
    /// `mlock` the backing arena.
    pub pin_memory: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
            cache_size: DEFAULT_CACHE_SIZE,
            data_room_size: DEFAULT_DATA_ROOM_SIZE,
            headroom: DEFAULT_HEADROOM,
            metadata_slots: DEFAULT_METADATA_SLOTS,
            align: CACHE_LINE_SIZE,
            numa_node: None,
            cores: num_cpus::get(),
            pin_memory: false,
        }
    }
}

impl MempoolConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Number of cached descriptors that triggers a flush to the shared ring.
    pub fn flush_threshold(&self) -> usize {
        self.cache_size as usize * 3 / 2
    }

    /// Bytes of private metadata after each header, as stored in
    /// `priv_size`.
    pub(crate) fn priv_size(&self) -> usize {
        self.metadata_slots as usize * METADATA_SLOT_SIZE
    }

    /// Offset of the data room inside an arena slot: header, then metadata,
    /// rounded up to the alignment.
    pub(crate) fn header_room(&self) -> usize {
        (mem::size_of::<MbufHeader>() + self.priv_size()).div_ceil(self.align) * self.align
    }

    /// Stride between two consecutive descriptors in the arena.
    pub(crate) fn slot_stride(&self) -> usize {
        let size = self.header_room() + self.data_room_size as usize;
        size.div_ceil(self.align) * self.align
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("capacity must be greater than 0".into()));
        }
        if self.cores == 0 {
            return Err(Error::Config("at least one core is required".into()));
        }
        if self.cache_size as usize > MAX_CACHE_SIZE {
            return Err(Error::Config(format!(
                "cache_size {} exceeds {}",
                self.cache_size, MAX_CACHE_SIZE
            )));
        }
        if self.flush_threshold() > self.capacity as usize {
            return Err(Error::Config(format!(
                "cache flush threshold {} exceeds capacity {}",
                self.flush_threshold(),
                self.capacity
            )));
        }
        if self.data_room_size == 0 {
            return Err(Error::Config("data_room_size must be greater than 0".into()));
        }
        if self.headroom > self.data_room_size {
            return Err(Error::Config(format!(
                "headroom {} larger than data room {}",
                self.headroom, self.data_room_size
            )));
        }
        if self.priv_size() > u16::MAX as usize {
            return Err(Error::Config(format!(
                "{} metadata slots do not fit in priv_size",
                self.metadata_slots
            )));
        }
        if !self.align.is_power_of_two() || self.align < CACHE_LINE_SIZE {
            return Err(Error::Config(format!(
                "align {} must be a power of two >= {}",
                self.align, CACHE_LINE_SIZE
            )));
        }
        if self
            .slot_stride()
            .checked_mul(self.capacity as usize)
            .is_none_or(|total| total > isize::MAX as usize)
        {
            return Err(Error::Config("arena size overflows".into()));
        }

        let pinned = self.cores * self.flush_threshold();
        if pinned * 2 > self.capacity as usize {
            warn!(
                pool = %self.name,
                capacity = self.capacity,
                cache_size = self.cache_size,
                cores = self.cores,
                "per-core caches may pin more than half of the pool; expect refill/flush contention"
            );
        }
        Ok(())
    }
}
