//! Packet buffer handles.
//!
//! An [`Mbuf`] is one reference on a descriptor living in a [`Mempool`]
//! arena. Cloning a reference is explicit ([`Mbuf::acquire_reference`]) and
//! dropping a handle gives its reference back. Header fields and packet bytes
//! can be written only while the handle is the sole reference.
//!
//! [`Mempool`]: crate::pool::Mempool

mod layout;
pub mod ol_flags;
mod tx_offload;

pub use layout::{BufferIndex, LAYOUT_VERSION, MbufHeader, NO_NEXT, NO_PORT};
pub use ol_flags::{ChecksumLayer, ChecksumStatus, L4Checksum, OffloadRequest, TunnelType};
pub use tx_offload::{HeaderLengths, TxOffload};

use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::slice;
use std::sync::atomic::Ordering;

use thiserror::Error;
use tracing::error;
use triomphe::Arc;

use crate::checksum;
use crate::config::METADATA_SLOT_SIZE;
use crate::errors::{Error, Result};
use crate::pool::PoolInner;

/// Failed [`Mbuf::chain_append`]; the rejected tail is handed back.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct ChainError {
    pub error: Error,
    pub tail: Mbuf,
}

impl From<ChainError> for Error {
    fn from(err: ChainError) -> Self {
        err.error
    }
}

pub struct Mbuf {
    pool: Arc<PoolInner>,
    index: u32,
}

impl Mbuf {
    #[inline]
    pub(crate) fn from_parts(pool: Arc<PoolInner>, index: u32) -> Self {
        Self { pool, index }
    }

    #[inline]
    fn seg(&self, index: u32) -> &MbufHeader {
        // SAFETY: shared access; writers hold the only reference
        unsafe { &*self.pool.header_ptr(index) }
    }

    #[inline]
    fn hdr(&self) -> &MbufHeader {
        self.seg(self.index)
    }

    #[inline]
    fn check_exclusive(&self) -> Result<()> {
        let refcnt = self.refcnt();
        if refcnt != 1 {
            return Err(Error::NotExclusive {
                index: self.index,
                refcnt,
            });
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `check_exclusive` succeeded for this handle, `index` is a segment of
    /// its chain and no other reference into that segment's header is alive.
    #[inline]
    unsafe fn seg_mut(&mut self, index: u32) -> &mut MbufHeader {
        unsafe { &mut *self.pool.header_ptr(index) }
    }

    #[inline]
    fn hdr_mut(&mut self) -> Result<&mut MbufHeader> {
        self.check_exclusive()?;
        let index = self.index;
        Ok(unsafe { self.seg_mut(index) })
    }

    fn last_segment(&self) -> u32 {
        let mut index = self.index;
        while let Some(next) = self.seg(index).next_index() {
            index = next;
        }
        index
    }

    /// Takes the handle apart without touching the reference count.
    fn into_parts(self) -> (Arc<PoolInner>, u32) {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never used again and its own drop is suppressed
        let pool = unsafe { ptr::read(&this.pool) };
        (pool, this.index)
    }

    pub fn header(&self) -> &MbufHeader {
        self.hdr()
    }

    pub fn index(&self) -> BufferIndex {
        BufferIndex(self.index)
    }

    pub fn pool_id(&self) -> u64 {
        self.hdr().pool
    }

    pub fn refcnt(&self) -> u16 {
        self.hdr().refcnt.load(Ordering::Acquire)
    }

    pub fn is_unique(&self) -> bool {
        self.refcnt() == 1
    }

    /// Adds a reference and returns it as a new handle.
    pub fn acquire_reference(&self) -> Result<Mbuf> {
        self.pool.acquire(self.index)?;
        Ok(Mbuf::from_parts(self.pool.clone(), self.index))
    }

    /// Gives the reference back. Returns `true` when it was the last one and
    /// the chain went back to the shared ring.
    pub fn release_reference(self) -> Result<bool> {
        let (pool, index) = self.into_parts();
        pool.release_chain(index, |i| pool.ring_push(i))
    }

    /// Turns the handle into a plain index, for hand-off through an external
    /// ring. The reference travels with the index; see [`Mempool::from_raw`].
    ///
    /// [`Mempool::from_raw`]: crate::pool::Mempool::from_raw
    pub fn into_raw(self) -> BufferIndex {
        BufferIndex(self.into_parts().1)
    }

    pub fn buf_len(&self) -> usize {
        self.hdr().buf_len as usize
    }

    /// Bytes of the head segment.
    pub fn data_len(&self) -> usize {
        self.hdr().data_len as usize
    }

    /// Bytes of the whole chain.
    pub fn pkt_len(&self) -> usize {
        self.hdr().pkt_len as usize
    }

    pub fn segment_count(&self) -> u16 {
        self.hdr().nb_segs
    }

    pub fn is_contiguous(&self) -> bool {
        self.hdr().nb_segs == 1
    }

    /// Free bytes in front of the head segment's data.
    pub fn headroom(&self) -> usize {
        self.hdr().data_off as usize
    }

    /// Free bytes after the last segment's data.
    pub fn tailroom(&self) -> usize {
        let last = self.seg(self.last_segment());
        last.buf_len as usize - last.data_off as usize - last.data_len as usize
    }

    /// Packet bytes of the head segment.
    pub fn data(&self) -> &[u8] {
        Segment { hdr: self.hdr() }.data()
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let hdr = self.hdr_mut()?;
        let len = hdr.data_len as usize;
        // SAFETY: the data lies within the room and we hold the only reference
        Ok(unsafe { slice::from_raw_parts_mut(hdr.buf_addr.add(hdr.data_off as usize), len) })
    }

    /// Grows the head segment by `len` bytes at the front and returns them.
    pub fn prepend(&mut self, len: usize) -> Result<&mut [u8]> {
        let hdr = self.hdr_mut()?;
        if len > hdr.data_off as usize {
            return Err(Error::OutOfRoom {
                requested: len,
                available: hdr.data_off as usize,
            });
        }
        hdr.data_off -= len as u16;
        hdr.data_len += len as u16;
        hdr.pkt_len += len as u32;
        Ok(unsafe { slice::from_raw_parts_mut(hdr.buf_addr.add(hdr.data_off as usize), len) })
    }

    /// Grows the last segment by `len` bytes at the end and returns them.
    pub fn append(&mut self, len: usize) -> Result<&mut [u8]> {
        self.check_exclusive()?;
        let available = self.tailroom();
        if len > available {
            return Err(Error::OutOfRoom {
                requested: len,
                available,
            });
        }
        let (head, last) = (self.index, self.last_segment());
        unsafe {
            self.seg_mut(head).pkt_len += len as u32;
            let seg = self.seg_mut(last);
            let tail = seg.buf_addr.add(seg.data_off as usize + seg.data_len as usize);
            seg.data_len += len as u16;
            Ok(slice::from_raw_parts_mut(tail, len))
        }
    }

    /// Drops `len` bytes from the front of the head segment.
    pub fn adj(&mut self, len: usize) -> Result<()> {
        let hdr = self.hdr_mut()?;
        if len > hdr.data_len as usize {
            return Err(Error::OutOfRoom {
                requested: len,
                available: hdr.data_len as usize,
            });
        }
        hdr.data_off += len as u16;
        hdr.data_len -= len as u16;
        hdr.pkt_len -= len as u32;
        Ok(())
    }

    /// Drops `len` bytes from the end of the last segment.
    pub fn trim(&mut self, len: usize) -> Result<()> {
        self.check_exclusive()?;
        let (head, last) = (self.index, self.last_segment());
        let available = self.seg(last).data_len as usize;
        if len > available {
            return Err(Error::OutOfRoom {
                requested: len,
                available,
            });
        }
        unsafe {
            self.seg_mut(last).data_len -= len as u16;
            self.seg_mut(head).pkt_len -= len as u32;
        }
        Ok(())
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        self.append(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Copies the whole packet into `target` as a single segment, at the same
    /// data offset as this buffer's head.
    pub fn copy_data_into(&self, target: &mut Mbuf) -> Result<()> {
        let data_off = self.headroom();
        let pkt_len = self.pkt_len();
        let hdr = target.hdr_mut()?;
        if hdr.nb_segs != 1 {
            return Err(Error::InvalidChainOperation("copy target is chained"));
        }
        let available = (hdr.buf_len as usize).saturating_sub(data_off);
        if pkt_len > available {
            return Err(Error::OutOfRoom {
                requested: pkt_len,
                available,
            });
        }
        let mut dst = unsafe { hdr.buf_addr.add(data_off) };
        for seg in self.segments() {
            let src = seg.data();
            // SAFETY: distinct descriptors own distinct rooms
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
                dst = dst.add(src.len());
            }
        }
        hdr.data_off = data_off as u16;
        hdr.data_len = pkt_len as u16;
        hdr.pkt_len = pkt_len as u32;
        Ok(())
    }

    pub fn segments(&self) -> Segments<'_> {
        Segments {
            pool: &self.pool,
            next: Some(self.index),
        }
    }

    /// Links `tail` (a single segment or a whole chain) after the last
    /// segment of this chain. Both handles must be the only reference on
    /// their chain and come from the same pool.
    pub fn chain_append(&mut self, tail: Mbuf) -> std::result::Result<(), ChainError> {
        let reject = |tail: Mbuf, reason: &'static str| -> std::result::Result<(), ChainError> {
            Err(ChainError {
                error: Error::InvalidChainOperation(reason),
                tail,
            })
        };
        if tail.pool_id() != self.pool_id() {
            return reject(tail, "segments belong to different pools");
        }
        if tail.index == self.index {
            return reject(tail, "cannot chain a buffer to itself");
        }
        if !self.is_unique() {
            return reject(tail, "head is shared");
        }
        if !tail.is_unique() {
            return reject(tail, "tail is shared");
        }
        let nb_segs = match self.segment_count().checked_add(tail.segment_count()) {
            Some(n) => n,
            None => return reject(tail, "segment count overflow"),
        };
        let pkt_len = match self.hdr().pkt_len.checked_add(tail.hdr().pkt_len) {
            Some(n) => n,
            None => return reject(tail, "packet length overflow"),
        };

        let (head, last) = (self.index, self.last_segment());
        // The tail's reference now belongs to the chain.
        let (_, tail) = tail.into_parts();
        unsafe {
            self.seg_mut(last).next = tail as u64;
            let hdr = self.seg_mut(head);
            hdr.nb_segs = nb_segs;
            hdr.pkt_len = pkt_len;
        }
        Ok(())
    }

    pub fn ol_flags(&self) -> u64 {
        self.hdr().ol_flags
    }

    /// True when every bit of `flag` is set.
    pub fn has_offload_flag(&self, flag: u64) -> bool {
        self.hdr().ol_flags & flag == flag
    }

    /// Sets raw flag bits, as a device does on receive.
    pub fn set_offload_flags(&mut self, flags: u64) -> Result<()> {
        self.hdr_mut()?.ol_flags |= flags;
        Ok(())
    }

    pub fn clear_offload_flags(&mut self) -> Result<()> {
        self.hdr_mut()?.ol_flags = 0;
        Ok(())
    }

    /// Clears every RX bit, keeps TX requests. Returns the new flag word.
    pub fn clear_rx_offload_flags(&mut self) -> Result<u64> {
        let hdr = self.hdr_mut()?;
        hdr.ol_flags &= !ol_flags::RX_OFFLOAD_MASK;
        Ok(hdr.ol_flags)
    }

    pub fn checksum_status(&self, layer: ChecksumLayer) -> ChecksumStatus {
        ChecksumStatus::decode(self.hdr().ol_flags, layer)
    }

    pub fn set_rx_checksum_status(
        &mut self,
        layer: ChecksumLayer,
        status: ChecksumStatus,
    ) -> Result<()> {
        let hdr = self.hdr_mut()?;
        hdr.ol_flags = status.encode(hdr.ol_flags, layer);
        Ok(())
    }

    /// Records a transmit offload intent. Segmentation requests also store
    /// the segment size in the offload context.
    pub fn set_offload_request(&mut self, request: OffloadRequest) -> Result<()> {
        let hdr = self.hdr_mut()?;
        if let OffloadRequest::TcpSegmentation { segment_size }
        | OffloadRequest::UdpSegmentation { segment_size } = request
        {
            let mut tx = TxOffload(hdr.tx_offload);
            tx.set_tso_segsz(segment_size as u64)?;
            hdr.tx_offload = tx.0;
        }
        hdr.ol_flags = request.apply(hdr.ol_flags);
        Ok(())
    }

    pub fn l4_checksum_request(&self) -> L4Checksum {
        L4Checksum::from_flags(self.hdr().ol_flags)
    }

    pub fn tunnel_type(&self) -> TunnelType {
        TunnelType::from_flags(self.hdr().ol_flags)
    }

    pub fn tx_offload(&self) -> TxOffload {
        TxOffload(self.hdr().tx_offload)
    }

    pub fn set_tx_offload(&mut self, tx: TxOffload) -> Result<()> {
        self.hdr_mut()?.tx_offload = tx.0;
        Ok(())
    }

    pub fn set_header_lengths(&mut self, lens: HeaderLengths) -> Result<()> {
        let hdr = self.hdr_mut()?;
        hdr.tx_offload = TxOffload(hdr.tx_offload).with_header_lengths(lens)?.0;
        Ok(())
    }

    /// Checks the IPv4 header checksum in software and records the verdict
    /// in the RX IP status field.
    pub fn verify_ip_checksum(&mut self) -> Result<ChecksumStatus> {
        self.check_exclusive()?;
        let status = checksum::ip_checksum_status(self.data());
        self.set_rx_checksum_status(ChecksumLayer::Ip, status)?;
        Ok(status)
    }

    /// Input port, `None` for locally built packets.
    pub fn port(&self) -> Option<u16> {
        let port = self.hdr().port;
        (port != NO_PORT).then_some(port)
    }

    pub fn set_port(&mut self, port: u16) -> Result<()> {
        self.hdr_mut()?.port = port;
        Ok(())
    }

    pub fn packet_type(&self) -> u32 {
        self.hdr().packet_type
    }

    pub fn set_packet_type(&mut self, packet_type: u32) -> Result<()> {
        self.hdr_mut()?.packet_type = packet_type;
        Ok(())
    }

    pub fn vlan_tci(&self) -> u16 {
        self.hdr().vlan_tci
    }

    pub fn set_vlan_tci(&mut self, tci: u16) -> Result<()> {
        self.hdr_mut()?.vlan_tci = tci;
        Ok(())
    }

    pub fn vlan_tci_outer(&self) -> u16 {
        self.hdr().vlan_tci_outer
    }

    pub fn set_vlan_tci_outer(&mut self, tci: u16) -> Result<()> {
        self.hdr_mut()?.vlan_tci_outer = tci;
        Ok(())
    }

    /// RSS hash, if the device computed one.
    pub fn rss_hash(&self) -> Option<u32> {
        let hdr = self.hdr();
        (hdr.ol_flags & ol_flags::RX_RSS_HASH != 0).then_some(hdr.hash_rss)
    }

    pub fn set_rss_hash(&mut self, hash: u32) -> Result<()> {
        let hdr = self.hdr_mut()?;
        hdr.hash_rss = hash;
        hdr.ol_flags |= ol_flags::RX_RSS_HASH;
        Ok(())
    }

    pub fn timestamp(&self) -> Option<u64> {
        let hdr = self.hdr();
        (hdr.ol_flags & ol_flags::RX_TIMESTAMP != 0).then_some(hdr.timestamp)
    }

    pub fn set_timestamp(&mut self, timestamp: u64) -> Result<()> {
        let hdr = self.hdr_mut()?;
        hdr.timestamp = timestamp;
        hdr.ol_flags |= ol_flags::RX_TIMESTAMP;
        Ok(())
    }

    pub fn userdata(&self) -> u64 {
        self.hdr().userdata
    }

    pub fn set_userdata(&mut self, userdata: u64) -> Result<()> {
        self.hdr_mut()?.userdata = userdata;
        Ok(())
    }

    pub fn seqn(&self) -> u32 {
        self.hdr().seqn
    }

    pub fn set_seqn(&mut self, seqn: u32) -> Result<()> {
        self.hdr_mut()?.seqn = seqn;
        Ok(())
    }

    /// Number of private 64-bit metadata words stored after the header.
    pub fn metadata_slots(&self) -> usize {
        self.hdr().priv_size() as usize / METADATA_SLOT_SIZE
    }

    #[inline]
    fn metadata_slot_ptr(&self, slot: usize) -> Result<*mut u64> {
        let slots = self.metadata_slots();
        if slot >= slots {
            return Err(Error::FieldOverflow {
                field: "metadata_slot",
                value: slot as u64,
                max: (slots as u64).saturating_sub(1),
            });
        }
        // SAFETY: slot < slots, inside this descriptor's metadata area
        Ok(unsafe { self.pool.metadata_ptr(self.index).add(slot) })
    }

    /// Reads private metadata word `slot`. Slots are not cleared between
    /// allocations.
    pub fn metadata_slot(&self, slot: usize) -> Result<u64> {
        let ptr = self.metadata_slot_ptr(slot)?;
        // SAFETY: writers hold the only reference
        Ok(unsafe { ptr::read(ptr) })
    }

    pub fn set_metadata_slot(&mut self, slot: usize, value: u64) -> Result<()> {
        self.check_exclusive()?;
        let ptr = self.metadata_slot_ptr(slot)?;
        // SAFETY: exclusive, and no reference into the metadata area is alive
        unsafe { ptr::write(ptr, value) };
        Ok(())
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        let pool = &self.pool;
        if let Err(err) = pool.release_chain(self.index, |i| pool.ring_push(i)) {
            error!(pool = pool.id(), index = self.index, %err, "mbuf release failed on drop");
            debug_assert!(false, "mbuf release failed on drop: {err}");
        }
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hdr = self.hdr();
        f.debug_struct("Mbuf")
            .field("pool", &hdr.pool)
            .field("index", &self.index)
            .field("refcnt", &self.refcnt())
            .field("nb_segs", &hdr.nb_segs)
            .field("data_off", &hdr.data_off)
            .field("data_len", &hdr.data_len)
            .field("pkt_len", &hdr.pkt_len)
            .field("ol_flags", &format_args!("{:#x}", hdr.ol_flags))
            .finish()
    }
}

impl fmt::Display for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hdr = self.hdr();
        write!(
            f,
            "Mbuf(&buf_addr={:p}, data_len={}, refcnt={}, data_off={}, data=",
            hdr.buf_addr,
            hdr.data_len,
            self.refcnt(),
            hdr.data_off,
        )?;
        for byte in self.data() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Iterator over the segments of a chain, head first.
pub struct Segments<'a> {
    pool: &'a PoolInner,
    next: Option<u32>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let hdr = unsafe { &*self.pool.header_ptr(index) };
        self.next = hdr.next_index();
        Some(Segment { hdr })
    }
}

/// Read-only view of one segment.
#[derive(Clone, Copy)]
pub struct Segment<'a> {
    hdr: &'a MbufHeader,
}

impl<'a> Segment<'a> {
    pub fn header(&self) -> &'a MbufHeader {
        self.hdr
    }

    pub fn data_len(&self) -> usize {
        self.hdr.data_len as usize
    }

    pub fn data(&self) -> &'a [u8] {
        let hdr = self.hdr;
        // SAFETY: data_off + data_len never exceeds the room
        unsafe {
            slice::from_raw_parts(hdr.buf_addr.add(hdr.data_off as usize), hdr.data_len as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::ol_flags::*;
    use super::*;
    use crate::config::MempoolConfig;
    use crate::pool::Mempool;

    fn pool(capacity: u32) -> Mempool {
        Mempool::new(MempoolConfig {
            capacity,
            cache_size: 0,
            data_room_size: 256,
            headroom: 64,
            cores: 1,
            ..Default::default()
        })
        .unwrap()
    }

    fn filled(pool: &Mempool, bytes: &[u8]) -> Mbuf {
        let mut m = pool.allocate_uncached().unwrap();
        m.extend_from_slice(bytes).unwrap();
        m
    }

    #[test]
    fn fresh_buffer_is_reset() {
        let pool = pool(2);
        let mut m = pool.allocate_uncached().unwrap();
        m.extend_from_slice(b"abc").unwrap();
        m.set_offload_request(OffloadRequest::IpChecksum).unwrap();
        m.set_port(3).unwrap();
        drop(m);
        let _other = pool.allocate_uncached().unwrap();
        let m = pool.allocate_uncached().unwrap();
        assert_eq!(m.refcnt(), 1);
        assert_eq!(m.data_len(), 0);
        assert_eq!(m.pkt_len(), 0);
        assert_eq!(m.headroom(), 64);
        assert_eq!(m.tailroom(), 192);
        assert_eq!(m.ol_flags(), 0);
        assert_eq!(m.port(), None);
        assert_eq!(m.segment_count(), 1);
    }

    #[test]
    fn shared_references_release_once() {
        let pool = pool(4);
        let m = pool.allocate_uncached().unwrap();
        let r1 = m.acquire_reference().unwrap();
        let r2 = r1.acquire_reference().unwrap();
        assert_eq!(m.refcnt(), 3);
        assert!(!r1.release_reference().unwrap());
        assert!(!m.release_reference().unwrap());
        assert_eq!(pool.available(), 3);
        assert!(r2.release_reference().unwrap());
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn acquire_on_free_descriptor_fails() {
        let pool = pool(2);
        let idx = pool.allocate_uncached().unwrap().into_raw();
        let stale = unsafe { pool.from_raw(idx) }.unwrap();
        let owner = unsafe { pool.from_raw(idx) }.unwrap();
        owner.release_reference().unwrap();
        assert!(matches!(stale.acquire_reference(), Err(Error::UseAfterFree { .. })));
        // Keep the stale handle from releasing a free descriptor.
        let _ = stale.into_raw();
    }

    #[test]
    fn refcount_saturates_with_error() {
        let pool = pool(1);
        let m = pool.allocate_uncached().unwrap();
        let mut refs = Vec::new();
        for _ in 1..u16::MAX {
            refs.push(m.acquire_reference().unwrap());
        }
        assert_eq!(m.refcnt(), u16::MAX);
        assert!(matches!(m.acquire_reference(), Err(Error::RefcountOverflow { .. })));
        drop(refs);
        assert!(m.release_reference().unwrap());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn shared_buffer_is_read_only() {
        let pool = pool(2);
        let mut m = filled(&pool, b"hello");
        let r = m.acquire_reference().unwrap();
        assert!(matches!(m.append(1), Err(Error::NotExclusive { refcnt: 2, .. })));
        assert!(matches!(m.set_port(1), Err(Error::NotExclusive { .. })));
        assert!(m.data_mut().is_err());
        assert_eq!(r.data(), b"hello");
        drop(r);
        m.data_mut().unwrap()[0] = b'j';
        assert_eq!(m.data(), b"jello");
    }

    #[test]
    fn data_room_edges() {
        let pool = pool(1);
        let mut m = pool.allocate_uncached().unwrap();
        m.extend_from_slice(b"payload").unwrap();
        m.prepend(4).unwrap().copy_from_slice(b"hdr:");
        assert_eq!(m.data(), b"hdr:payload");
        assert_eq!(m.pkt_len(), 11);
        assert_eq!(m.headroom(), 60);

        let err = m.prepend(61).unwrap_err();
        assert!(matches!(err, Error::OutOfRoom { requested: 61, available: 60 }));
        let err = m.append(m.tailroom() + 1).unwrap_err();
        assert!(matches!(err, Error::OutOfRoom { .. }));
        assert!(m.adj(12).is_err());
        assert!(m.trim(12).is_err());
        assert_eq!(m.data(), b"hdr:payload");

        m.adj(4).unwrap();
        m.trim(3).unwrap();
        assert_eq!(m.data(), b"payl");
        assert_eq!(m.pkt_len(), 4);

        let room = m.tailroom();
        m.append(room).unwrap();
        assert_eq!(m.tailroom(), 0);
        assert_eq!(m.headroom() + m.data_len(), m.buf_len());
    }

    #[test]
    fn chain_lengths_add_up() {
        let pool = pool(8);
        let mut head = filled(&pool, &[1; 10]);
        head.chain_append(filled(&pool, &[2; 20])).unwrap();
        let mut sub = filled(&pool, &[3; 30]);
        sub.chain_append(filled(&pool, &[4; 40])).unwrap();
        head.chain_append(sub).unwrap();

        assert_eq!(head.segment_count(), 4);
        assert_eq!(head.pkt_len(), 100);
        let lens: Vec<_> = head.segments().map(|s| s.data_len()).collect();
        assert_eq!(lens, [10, 20, 30, 40]);
        assert!(head.segments().enumerate().all(|(i, s)| s.data()[0] == i as u8 + 1));

        // append/trim act on the last segment
        head.extend_from_slice(&[4; 2]).unwrap();
        assert_eq!(head.segments().last().unwrap().data_len(), 42);
        head.trim(42).unwrap();
        assert_eq!(head.pkt_len(), 60);

        assert_eq!(pool.available(), 4);
        assert!(head.release_reference().unwrap());
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn chain_overflow_hands_the_tail_back() {
        let pool = pool(4);
        let mut head = filled(&pool, b"a");
        let header = head.pool.header_ptr(head.index);

        unsafe { (*header).nb_segs = u16::MAX };
        let tail = filled(&pool, b"b");
        let tail_index = tail.index();
        let err = head.chain_append(tail).unwrap_err();
        assert!(matches!(
            err.error,
            Error::InvalidChainOperation("segment count overflow")
        ));
        assert_eq!(err.tail.index(), tail_index);
        assert_eq!(err.tail.data(), b"b");
        drop(err);
        unsafe { (*header).nb_segs = 1 };

        unsafe { (*header).pkt_len = u32::MAX };
        let err = head.chain_append(filled(&pool, b"c")).unwrap_err();
        assert!(matches!(
            err.error,
            Error::InvalidChainOperation("packet length overflow")
        ));
        assert_eq!(err.tail.data(), b"c");
        drop(err);
        unsafe { (*header).pkt_len = 1 };

        assert_eq!(head.segment_count(), 1);
        assert_eq!(pool.available(), 3);
        drop(head);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn chain_rejects_shared_or_foreign_segments() {
        let pool = pool(8);
        let other = super::tests::pool(2);
        let mut head = pool.allocate_uncached().unwrap();

        let shared = pool.allocate_uncached().unwrap();
        let keep = shared.acquire_reference().unwrap();
        let err = head.chain_append(shared).unwrap_err();
        assert!(matches!(err.error, Error::InvalidChainOperation("tail is shared")));
        drop(err);
        drop(keep);

        let foreign = other.allocate_uncached().unwrap();
        let err = head.chain_append(foreign).unwrap_err();
        assert!(matches!(err.error, Error::InvalidChainOperation(_)));
        assert_eq!(err.tail.pool_id(), other.id());
        drop(err);

        let peer = head.acquire_reference().unwrap();
        let tail = pool.allocate_uncached().unwrap();
        let err = head.chain_append(tail).unwrap_err();
        assert!(matches!(err.error, Error::InvalidChainOperation("head is shared")));
        drop(err);
        drop(peer);

        let myself = unsafe { pool.from_raw(head.index()) }.unwrap();
        let err = head.chain_append(myself).unwrap_err();
        let _ = err.tail.into_raw();

        assert_eq!(head.segment_count(), 1);
        drop(head);
        assert_eq!(pool.available(), 8);
        assert_eq!(other.available(), 2);
    }

    #[test]
    fn shared_chain_frees_on_last_release() {
        let pool = pool(4);
        let mut head = filled(&pool, b"ab");
        head.chain_append(filled(&pool, b"cd")).unwrap();
        let peer = head.acquire_reference().unwrap();
        drop(head);
        assert_eq!(pool.available(), 2);
        assert_eq!(peer.segments().count(), 2);
        drop(peer);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn copy_linearizes_chain() {
        let pool = pool(4);
        let mut head = filled(&pool, b"abc");
        head.chain_append(filled(&pool, b"def")).unwrap();
        let mut target = filled(&pool, b"zzzzzzzzzzzz");
        head.copy_data_into(&mut target).unwrap();
        assert_eq!(target.data(), b"abcdef");
        assert_eq!(target.pkt_len(), 6);
        assert_eq!(target.headroom(), head.headroom());
    }

    #[test]
    fn udp_after_tcp_leaves_udp_pattern() {
        let pool = pool(1);
        let mut m = pool.allocate_uncached().unwrap();
        m.set_offload_request(OffloadRequest::L4Checksum(L4Checksum::Tcp)).unwrap();
        m.set_offload_request(OffloadRequest::L4Checksum(L4Checksum::Udp)).unwrap();
        assert_eq!(m.ol_flags() & TX_L4_MASK, TX_UDP_CKSUM);
        assert_eq!(m.l4_checksum_request(), L4Checksum::Udp);
    }

    #[test]
    fn tso_request_stores_segment_size() {
        let pool = pool(1);
        let mut m = pool.allocate_uncached().unwrap();
        m.set_header_lengths(HeaderLengths {
            l2: 14,
            l3: 20,
            l4: 20,
            ..Default::default()
        })
        .unwrap();
        m.set_offload_request(OffloadRequest::TcpSegmentation { segment_size: 1460 }).unwrap();
        assert!(m.has_offload_flag(TX_TCP_SEG | TX_TCP_CKSUM));
        assert_eq!(m.tx_offload().tso_segsz(), 1460);
        assert_eq!(m.tx_offload().l3_len(), 20);

        let err = m
            .set_header_lengths(HeaderLengths {
                l2: 200,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::FieldOverflow { field: "l2_len", .. }));
        assert_eq!(m.tx_offload().l2_len(), 14);
    }

    #[test]
    fn rx_flags_clear_keeps_tx_requests() {
        let pool = pool(1);
        let mut m = pool.allocate_uncached().unwrap();
        m.set_offload_flags(RX_VLAN | RX_IP_CKSUM_GOOD | RX_L4_CKSUM_BAD).unwrap();
        m.set_offload_request(OffloadRequest::Ipv4).unwrap();
        m.set_offload_request(OffloadRequest::IpChecksum).unwrap();
        assert_eq!(m.checksum_status(ChecksumLayer::Ip), ChecksumStatus::Good);
        assert_eq!(m.checksum_status(ChecksumLayer::L4), ChecksumStatus::Bad);
        assert_eq!(m.clear_rx_offload_flags().unwrap(), TX_IPV4 | TX_IP_CKSUM);
        assert_eq!(m.checksum_status(ChecksumLayer::Ip), ChecksumStatus::Unknown);
        m.clear_offload_flags().unwrap();
        assert_eq!(m.ol_flags(), 0);
    }

    #[test]
    fn metadata_round_trips() {
        let pool = pool(1);
        let mut m = pool.allocate_uncached().unwrap();
        assert_eq!(m.rss_hash(), None);
        m.set_rss_hash(0xdead_beef).unwrap();
        m.set_timestamp(42).unwrap();
        m.set_vlan_tci(100).unwrap();
        m.set_vlan_tci_outer(200).unwrap();
        m.set_packet_type(0x11).unwrap();
        m.set_userdata(7).unwrap();
        m.set_seqn(9).unwrap();
        m.set_port(1).unwrap();
        assert_eq!(m.rss_hash(), Some(0xdead_beef));
        assert!(m.has_offload_flag(RX_RSS_HASH | RX_TIMESTAMP));
        assert_eq!(m.timestamp(), Some(42));
        assert_eq!((m.vlan_tci(), m.vlan_tci_outer()), (100, 200));
        assert_eq!(m.packet_type(), 0x11);
        assert_eq!((m.userdata(), m.seqn(), m.port()), (7, 9, Some(1)));
    }

    #[test]
    fn metadata_slots_are_bounds_checked() {
        let pool = pool(2);
        let mut m = pool.allocate_uncached().unwrap();
        assert_eq!(m.metadata_slots(), 16);
        m.set_metadata_slot(0, 0x0102_0304).unwrap();
        m.set_metadata_slot(15, u64::MAX).unwrap();
        assert_eq!(m.metadata_slot(0).unwrap(), 0x0102_0304);
        assert_eq!(m.metadata_slot(15).unwrap(), u64::MAX);
        assert!(matches!(
            m.metadata_slot(16),
            Err(Error::FieldOverflow { field: "metadata_slot", value: 16, max: 15 })
        ));
        assert!(m.set_metadata_slot(16, 1).is_err());

        // neighbouring descriptors do not share words
        let mut n = pool.allocate_uncached().unwrap();
        n.set_metadata_slot(0, 9).unwrap();
        assert_eq!(m.metadata_slot(0).unwrap(), 0x0102_0304);

        let peer = m.acquire_reference().unwrap();
        assert!(matches!(
            m.set_metadata_slot(1, 5),
            Err(Error::NotExclusive { refcnt: 2, .. })
        ));
        assert_eq!(peer.metadata_slot(15).unwrap(), u64::MAX);
    }

    #[test]
    fn pool_without_metadata_has_no_slots() {
        let pool = Mempool::new(MempoolConfig {
            capacity: 1,
            cache_size: 0,
            cores: 1,
            metadata_slots: 0,
            ..Default::default()
        })
        .unwrap();
        let mut m = pool.allocate_uncached().unwrap();
        assert_eq!(m.metadata_slots(), 0);
        assert!(m.metadata_slot(0).is_err());
        assert!(m.set_metadata_slot(0, 1).is_err());
        m.extend_from_slice(b"data").unwrap();
        assert_eq!(m.data(), b"data");
    }

    #[test]
    fn display_prints_hex_bytes() {
        let pool = pool(1);
        let m = filled(&pool, &[0x0a, 0xff, 0x00]);
        let s = m.to_string();
        assert!(s.starts_with("Mbuf(&buf_addr="));
        assert!(s.ends_with("data=0aff00)"), "{s}");
        assert!(s.contains("refcnt=1"));
    }

    proptest! {
        #[test]
        fn refcount_sequences_free_exactly_once(
            ops in proptest::collection::vec(any::<bool>(), 0..64)
        ) {
            let pool = pool(1);
            let mut refs = vec![pool.allocate_uncached().unwrap()];
            for acquire in ops {
                if acquire {
                    let r = refs[0].acquire_reference().unwrap();
                    refs.push(r);
                } else if refs.len() > 1 {
                    let r = refs.pop().unwrap();
                    prop_assert!(!r.release_reference().unwrap());
                }
                prop_assert_eq!(refs[0].refcnt() as usize, refs.len());
                prop_assert_eq!(pool.available(), 0);
            }
            while let Some(r) = refs.pop() {
                let freed = r.release_reference().unwrap();
                prop_assert_eq!(freed, refs.is_empty());
            }
            prop_assert_eq!(pool.available(), 1);
        }

        #[test]
        fn chain_totals_match_segments(lens in proptest::collection::vec(0usize..=192, 1..16)) {
            let pool = pool(16);
            let mut head = filled(&pool, &vec![0xab; lens[0]]);
            for &len in &lens[1..] {
                head.chain_append(filled(&pool, &vec![0xcd; len])).unwrap();
            }
            prop_assert_eq!(head.segment_count() as usize, lens.len());
            prop_assert_eq!(head.pkt_len(), lens.iter().sum::<usize>());
            let seen: Vec<_> = head.segments().map(|s| s.data_len()).collect();
            prop_assert_eq!(seen, lens);
            drop(head);
            prop_assert_eq!(pool.available(), 16);
        }
    }
}
