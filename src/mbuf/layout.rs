//! Binary layout of the buffer descriptor.
//!
//! The header mirrors the DPDK 18.11 `rte_mbuf` layout field for field: two
//! 64-byte cache lines, the hot RX/TX fields in the first one. Peer processes
//! and DMA engines read it straight out of shared memory, so the field order
//! and widths below are a contract. Bump [`LAYOUT_VERSION`] on any change.

use std::sync::atomic::AtomicU16;

use crate::config::CACHE_LINE_SIZE;

pub const LAYOUT_VERSION: u32 = 1;

/// Value of `next` on the last segment of a chain.
pub const NO_NEXT: u64 = u64::MAX;
/// Value of `port` on a descriptor that was not received from a device.
pub const NO_PORT: u16 = u16::MAX;

/// Index of a descriptor inside its pool's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferIndex(pub(crate) u32);

impl From<u32> for BufferIndex {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl From<BufferIndex> for u32 {
    fn from(val: BufferIndex) -> u32 {
        val.0
    }
}

impl From<BufferIndex> for usize {
    fn from(val: BufferIndex) -> usize {
        val.0 as usize
    }
}

#[repr(C, align(64))]
#[derive(Debug)]
pub struct MbufHeader {
    pub(crate) buf_addr: *mut u8,
    pub(crate) buf_iova: u64,
    pub(crate) data_off: u16,
    pub(crate) refcnt: AtomicU16,
    pub(crate) nb_segs: u16,
    pub(crate) port: u16,
    pub(crate) ol_flags: u64,
    pub(crate) packet_type: u32,
    pub(crate) pkt_len: u32,
    pub(crate) data_len: u16,
    pub(crate) vlan_tci: u16,
    pub(crate) hash_rss: u32,
    pub(crate) hash_hi: u32,
    pub(crate) vlan_tci_outer: u16,
    pub(crate) buf_len: u16,
    pub(crate) timestamp: u64,
    // second cache line
    pub(crate) userdata: u64,
    pub(crate) pool: u64,
    pub(crate) next: u64,
    pub(crate) tx_offload: u64,
    pub(crate) priv_size: u16,
    pub(crate) timesync: u16,
    pub(crate) seqn: u32,
    pub(crate) shinfo: u64,
}

const _: () = assert!(std::mem::align_of::<MbufHeader>() == CACHE_LINE_SIZE);
const _: () = assert!(std::mem::size_of::<MbufHeader>() == 2 * CACHE_LINE_SIZE);

impl MbufHeader {
    /// A free descriptor bound to its slot of backing memory, followed by
    /// `priv_size` bytes of private metadata.
    pub(crate) fn new(
        buf_addr: *mut u8,
        buf_iova: u64,
        buf_len: u16,
        priv_size: u16,
        pool: u64,
    ) -> Self {
        Self {
            buf_addr,
            buf_iova,
            data_off: 0,
            refcnt: AtomicU16::new(0),
            nb_segs: 1,
            port: NO_PORT,
            ol_flags: 0,
            packet_type: 0,
            pkt_len: 0,
            data_len: 0,
            vlan_tci: 0,
            hash_rss: 0,
            hash_hi: 0,
            vlan_tci_outer: 0,
            buf_len,
            timestamp: 0,
            userdata: 0,
            pool,
            next: NO_NEXT,
            tx_offload: 0,
            priv_size,
            timesync: 0,
            seqn: 0,
            shinfo: 0,
        }
    }

    /// Puts the mutable part of the header back into its post-allocation
    /// state. Backing memory, IOVA and pool binding are left untouched.
    pub(crate) fn reset(&mut self, headroom: u16) {
        self.data_off = headroom.min(self.buf_len);
        self.nb_segs = 1;
        self.port = NO_PORT;
        self.ol_flags = 0;
        self.packet_type = 0;
        self.pkt_len = 0;
        self.data_len = 0;
        self.vlan_tci = 0;
        self.hash_rss = 0;
        self.hash_hi = 0;
        self.vlan_tci_outer = 0;
        self.timestamp = 0;
        self.userdata = 0;
        self.next = NO_NEXT;
        self.tx_offload = 0;
        self.timesync = 0;
        self.seqn = 0;
    }

    pub fn buf_iova(&self) -> u64 {
        self.buf_iova
    }

    pub fn data_off(&self) -> u16 {
        self.data_off
    }

    pub fn nb_segs(&self) -> u16 {
        self.nb_segs
    }

    pub fn pkt_len(&self) -> u32 {
        self.pkt_len
    }

    pub fn data_len(&self) -> u16 {
        self.data_len
    }

    pub fn buf_len(&self) -> u16 {
        self.buf_len
    }

    pub fn ol_flags(&self) -> u64 {
        self.ol_flags
    }

    pub fn tx_offload(&self) -> u64 {
        self.tx_offload
    }

    pub fn pool_id(&self) -> u64 {
        self.pool
    }

    pub fn priv_size(&self) -> u16 {
        self.priv_size
    }

    pub(crate) fn next_index(&self) -> Option<u32> {
        (self.next != NO_NEXT).then_some(self.next as u32)
    }
}
