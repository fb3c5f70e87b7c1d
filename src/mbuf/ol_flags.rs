//! Offload flag bit assignments.
//!
//! RX flags grow upwards from bit 0, TX flags grow downwards from bit 60, the
//! three most significant bits are generic. The positions are shared with the
//! device drivers and must not move.

pub const RX_VLAN: u64 = 1 << 0;
pub const RX_RSS_HASH: u64 = 1 << 1;
pub const RX_FDIR: u64 = 1 << 2;
pub const RX_EIP_CKSUM_BAD: u64 = 1 << 5;
pub const RX_VLAN_STRIPPED: u64 = 1 << 6;

pub const RX_IP_CKSUM_MASK: u64 = (1 << 4) | (1 << 7);
pub const RX_IP_CKSUM_UNKNOWN: u64 = 0;
pub const RX_IP_CKSUM_BAD: u64 = 1 << 4;
pub const RX_IP_CKSUM_GOOD: u64 = 1 << 7;
pub const RX_IP_CKSUM_NONE: u64 = (1 << 4) | (1 << 7);

pub const RX_L4_CKSUM_MASK: u64 = (1 << 3) | (1 << 8);
pub const RX_L4_CKSUM_UNKNOWN: u64 = 0;
pub const RX_L4_CKSUM_BAD: u64 = 1 << 3;
pub const RX_L4_CKSUM_GOOD: u64 = 1 << 8;
pub const RX_L4_CKSUM_NONE: u64 = (1 << 3) | (1 << 8);

pub const RX_IEEE1588_PTP: u64 = 1 << 9;
pub const RX_IEEE1588_TMST: u64 = 1 << 10;
pub const RX_FDIR_ID: u64 = 1 << 13;
pub const RX_FDIR_FLX: u64 = 1 << 14;
pub const RX_QINQ_STRIPPED: u64 = 1 << 15;
pub const RX_LRO: u64 = 1 << 16;
pub const RX_TIMESTAMP: u64 = 1 << 17;
pub const RX_SEC_OFFLOAD: u64 = 1 << 18;
pub const RX_SEC_OFFLOAD_FAILED: u64 = 1 << 19;
pub const RX_QINQ: u64 = 1 << 20;

/// Every bit a device may set on receive.
pub const RX_OFFLOAD_MASK: u64 = (1 << 21) - 1;

pub const TX_UDP_SEG: u64 = 1 << 42;
pub const TX_SEC_OFFLOAD: u64 = 1 << 43;
pub const TX_MACSEC: u64 = 1 << 44;

pub const TX_TUNNEL_SHIFT: u32 = 45;
pub const TX_TUNNEL_VXLAN: u64 = 0x1 << TX_TUNNEL_SHIFT;
pub const TX_TUNNEL_GRE: u64 = 0x2 << TX_TUNNEL_SHIFT;
pub const TX_TUNNEL_IPIP: u64 = 0x3 << TX_TUNNEL_SHIFT;
pub const TX_TUNNEL_GENEVE: u64 = 0x4 << TX_TUNNEL_SHIFT;
pub const TX_TUNNEL_MPLSINUDP: u64 = 0x5 << TX_TUNNEL_SHIFT;
pub const TX_TUNNEL_MASK: u64 = 0xF << TX_TUNNEL_SHIFT;

pub const TX_QINQ: u64 = 1 << 49;
pub const TX_TCP_SEG: u64 = 1 << 50;
pub const TX_IEEE1588_TMST: u64 = 1 << 51;

pub const TX_L4_SHIFT: u32 = 52;
pub const TX_L4_NO_CKSUM: u64 = 0 << TX_L4_SHIFT;
pub const TX_TCP_CKSUM: u64 = 1 << TX_L4_SHIFT;
pub const TX_SCTP_CKSUM: u64 = 2 << TX_L4_SHIFT;
pub const TX_UDP_CKSUM: u64 = 3 << TX_L4_SHIFT;
pub const TX_L4_MASK: u64 = 3 << TX_L4_SHIFT;

pub const TX_IP_CKSUM: u64 = 1 << 54;
pub const TX_IPV4: u64 = 1 << 55;
pub const TX_IPV6: u64 = 1 << 56;
pub const TX_VLAN: u64 = 1 << 57;
pub const TX_OUTER_IP_CKSUM: u64 = 1 << 58;
pub const TX_OUTER_IPV4: u64 = 1 << 59;
pub const TX_OUTER_IPV6: u64 = 1 << 60;

/// TX bits that ask the hardware to do work.
pub const TX_OFFLOAD_MASK: u64 = TX_IP_CKSUM
    | TX_L4_MASK
    | TX_OUTER_IP_CKSUM
    | TX_TCP_SEG
    | TX_IEEE1588_TMST
    | TX_QINQ
    | TX_VLAN
    | TX_TUNNEL_MASK
    | TX_MACSEC
    | TX_SEC_OFFLOAD;

pub const IND_ATTACHED_MBUF: u64 = 1 << 62;
pub const CTRL_MBUF_FLAG: u64 = 1 << 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumLayer {
    Ip,
    L4,
}

impl ChecksumLayer {
    fn codes(self) -> [u64; 4] {
        match self {
            ChecksumLayer::Ip => [
                RX_IP_CKSUM_UNKNOWN,
                RX_IP_CKSUM_BAD,
                RX_IP_CKSUM_GOOD,
                RX_IP_CKSUM_NONE,
            ],
            ChecksumLayer::L4 => [
                RX_L4_CKSUM_UNKNOWN,
                RX_L4_CKSUM_BAD,
                RX_L4_CKSUM_GOOD,
                RX_L4_CKSUM_NONE,
            ],
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            ChecksumLayer::Ip => RX_IP_CKSUM_MASK,
            ChecksumLayer::L4 => RX_L4_CKSUM_MASK,
        }
    }
}

/// RX checksum verdict reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumStatus {
    Unknown,
    Bad,
    Good,
    NoneComputed,
}

impl ChecksumStatus {
    pub fn decode(ol_flags: u64, layer: ChecksumLayer) -> Self {
        let [_, bad, good, none] = layer.codes();
        match ol_flags & layer.mask() {
            v if v == none => ChecksumStatus::NoneComputed,
            v if v == good => ChecksumStatus::Good,
            v if v == bad => ChecksumStatus::Bad,
            _ => ChecksumStatus::Unknown,
        }
    }

    /// Returns `ol_flags` with the status field of `layer` replaced.
    pub fn encode(self, ol_flags: u64, layer: ChecksumLayer) -> u64 {
        let [unknown, bad, good, none] = layer.codes();
        let code = match self {
            ChecksumStatus::Unknown => unknown,
            ChecksumStatus::Bad => bad,
            ChecksumStatus::Good => good,
            ChecksumStatus::NoneComputed => none,
        };
        (ol_flags & !layer.mask()) | code
    }
}

/// L4 checksum the hardware should insert on transmit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L4Checksum {
    None,
    Tcp,
    Sctp,
    Udp,
}

impl L4Checksum {
    pub fn bits(self) -> u64 {
        match self {
            L4Checksum::None => TX_L4_NO_CKSUM,
            L4Checksum::Tcp => TX_TCP_CKSUM,
            L4Checksum::Sctp => TX_SCTP_CKSUM,
            L4Checksum::Udp => TX_UDP_CKSUM,
        }
    }

    pub fn from_flags(ol_flags: u64) -> Self {
        match ol_flags & TX_L4_MASK {
            TX_TCP_CKSUM => L4Checksum::Tcp,
            TX_SCTP_CKSUM => L4Checksum::Sctp,
            TX_UDP_CKSUM => L4Checksum::Udp,
            _ => L4Checksum::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelType {
    None,
    Vxlan,
    Gre,
    Ipip,
    Geneve,
    MplsInUdp,
}

impl TunnelType {
    pub fn bits(self) -> u64 {
        match self {
            TunnelType::None => 0,
            TunnelType::Vxlan => TX_TUNNEL_VXLAN,
            TunnelType::Gre => TX_TUNNEL_GRE,
            TunnelType::Ipip => TX_TUNNEL_IPIP,
            TunnelType::Geneve => TX_TUNNEL_GENEVE,
            TunnelType::MplsInUdp => TX_TUNNEL_MPLSINUDP,
        }
    }

    /// Codes without a name decode as `None`.
    pub fn from_flags(ol_flags: u64) -> Self {
        match ol_flags & TX_TUNNEL_MASK {
            TX_TUNNEL_VXLAN => TunnelType::Vxlan,
            TX_TUNNEL_GRE => TunnelType::Gre,
            TX_TUNNEL_IPIP => TunnelType::Ipip,
            TX_TUNNEL_GENEVE => TunnelType::Geneve,
            TX_TUNNEL_MPLSINUDP => TunnelType::MplsInUdp,
            _ => TunnelType::None,
        }
    }
}

/// A transmit-side offload intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffloadRequest {
    IpChecksum,
    L4Checksum(L4Checksum),
    /// TCP segmentation; implies a TCP checksum.
    TcpSegmentation { segment_size: u16 },
    UdpSegmentation { segment_size: u16 },
    Tunnel(TunnelType),
    VlanInsert,
    QinqInsert,
    OuterIpChecksum,
    Ipv4,
    Ipv6,
    OuterIpv4,
    OuterIpv6,
}

impl OffloadRequest {
    /// Applies the request to a flag word. Multi-bit fields are replaced,
    /// single bits are set. Address family markers are exclusive per layer.
    pub fn apply(self, ol_flags: u64) -> u64 {
        match self {
            OffloadRequest::IpChecksum => ol_flags | TX_IP_CKSUM,
            OffloadRequest::L4Checksum(kind) => (ol_flags & !TX_L4_MASK) | kind.bits(),
            OffloadRequest::TcpSegmentation { .. } => {
                (ol_flags & !TX_L4_MASK) | TX_TCP_SEG | TX_TCP_CKSUM
            }
            OffloadRequest::UdpSegmentation { .. } => ol_flags | TX_UDP_SEG,
            OffloadRequest::Tunnel(kind) => (ol_flags & !TX_TUNNEL_MASK) | kind.bits(),
            OffloadRequest::VlanInsert => ol_flags | TX_VLAN,
            OffloadRequest::QinqInsert => ol_flags | TX_QINQ,
            OffloadRequest::OuterIpChecksum => ol_flags | TX_OUTER_IP_CKSUM,
            OffloadRequest::Ipv4 => (ol_flags & !TX_IPV6) | TX_IPV4,
            OffloadRequest::Ipv6 => (ol_flags & !TX_IPV4) | TX_IPV6,
            OffloadRequest::OuterIpv4 => (ol_flags & !TX_OUTER_IPV6) | TX_OUTER_IPV4,
            OffloadRequest::OuterIpv6 => (ol_flags & !TX_OUTER_IPV4) | TX_OUTER_IPV6,
        }
    }
}
