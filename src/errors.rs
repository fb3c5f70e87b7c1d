use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("mempool {pool_id} exhausted")]
    PoolExhausted { pool_id: u64 },
    #[error("double free of mbuf {index}")]
    DoubleFree { index: u32 },
    #[error("use after free of mbuf {index}")]
    UseAfterFree { index: u32 },
    #[error("reference count overflow on mbuf {index}")]
    RefcountOverflow { index: u32 },
    #[error("invalid chain operation: {0}")]
    InvalidChainOperation(&'static str),
    #[error("mbuf {index} is shared (refcnt {refcnt})")]
    NotExclusive { index: u32, refcnt: u16 },
    #[error("not enough room: requested {requested}, available {available}")]
    OutOfRoom { requested: usize, available: usize },
    #[error("{field} = {value} does not fit (max {max})")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        max: u64,
    },
    #[error("mbuf index {index} out of range")]
    InvalidIndex { index: u32 },
    #[error("mbuf belongs to pool {found}, expected pool {expected}")]
    ForeignBuffer { expected: u64, found: u64 },
    #[error("core {core} out of range ({cores} cores configured)")]
    CoreOutOfRange { core: usize, cores: usize },
    #[error("cache of core {core} is already checked out")]
    CoreInUse { core: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Toml(#[from] toml::de::Error),
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("Can't allocate memory")]
    NoMemory,
    #[error("{0}")]
    Generic(#[from] io::Error),
}

impl Error {
    /// Exhaustion is the only condition a caller is expected to recover from
    /// (drop the packet, apply backpressure). Everything else is misuse.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
