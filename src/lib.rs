//! Packet buffers and the per-core mempool they are allocated from.

pub mod checksum;
pub mod config;
pub mod errors;
pub mod mbuf;
pub mod pool;

pub use config::MempoolConfig;
pub use errors::{Error, Result};
pub use mbuf::{BufferIndex, ChainError, Mbuf};
pub use pool::{AddressTranslator, CacheStats, CoreCache, Mempool, VirtualAddressing};
