//! Software checksum and hash helpers, used when the device did not do the
//! work.

use etherparse::{Ipv4HeaderSlice, NetHeaders, PacketHeaders};

use crate::errors::{Error, Result};
use crate::mbuf::ChecksumStatus;

/// Header checksum of a raw IPv4 header. The checksum field in `header` is
/// ignored.
pub fn ipv4_header_checksum(header: &[u8]) -> Result<u16> {
    let slice = Ipv4HeaderSlice::from_slice(header)
        .map_err(|e| Error::MalformedHeader(e.to_string()))?;
    Ok(slice.to_header().calc_header_checksum())
}

/// Verifies the IPv4 header checksum of an Ethernet frame.
pub fn ip_checksum_status(frame: &[u8]) -> ChecksumStatus {
    let Ok(headers) = PacketHeaders::from_ethernet_slice(frame) else {
        return ChecksumStatus::Bad;
    };
    match headers.net {
        Some(NetHeaders::Ipv4(hdr, _)) if hdr.header_checksum == hdr.calc_header_checksum() => {
            ChecksumStatus::Good
        }
        Some(NetHeaders::Ipv4(..)) => ChecksumStatus::Bad,
        _ => ChecksumStatus::NoneComputed,
    }
}

/// CRC32C over `data`, seeded with `init`. No final inversion, so results
/// can be fed back as the seed of the next call.
#[inline]
pub fn crc_hash(data: &[u8], init: u32) -> u32 {
    // crc32c_append inverts on the way in and out
    !crc32c::crc32c_append(!init, data)
}
