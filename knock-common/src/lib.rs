#![cfg_attr(not(test), no_std)]
use core::net::Ipv4Addr;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPPROTO_UDP: u8 = 17;

// eth + ipv4 + udp, no payload
pub const KNOCK_MIN_FRAME_LEN: usize = EthHdr::LEN + Ipv4Hdr::LEN + UdpHdr::LEN;
// anything above carries payload (60 = minimum ethernet frame incl. padding)
pub const KNOCK_MAX_FRAME_LEN: usize = 60;

pub const KNOCK_RING_BYTE_SIZE: u32 = 1 << 24; // 16MB

// same values as the kernel's bpf_ringbuf_output flags
pub const BPF_RB_NO_WAKEUP: u64 = 1;
pub const BPF_RB_FORCE_WAKEUP: u64 = 2;

pub const KNOCK_PROGRAM: &str = "knock_xdp";
pub const KNOCK_EVENTS_MAP: &str = "KNOCK_EVENTS";
pub const KNOCK_FILTER_MAP: &str = "KNOCK_FILTER";

// slots of KNOCK_FILTER, 0 = off, 1 = on
pub const FILTER_STRICT_ETHERTYPE: u32 = 0;
pub const FILTER_DEBUG: u32 = 1;
pub const FILTER_SLOTS: u32 = 2;

/// Record handed from the classifier to the consumer, 8 bytes.
///
/// `source_address` is in host byte order, `destination_port` is kept in
/// network byte order exactly as it appeared in the UDP header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct KnockEvent {
    pub source_address: u32,
    pub destination_port: [u8; 2],
    pub padding: [u8; 2],
}

impl KnockEvent {
    pub const LEN: usize = core::mem::size_of::<KnockEvent>();

    pub const fn new(source_address: u32, destination_port: [u8; 2]) -> Self {
        Self {
            source_address,
            destination_port,
            padding: [0; 2],
        }
    }

    pub fn source_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.source_address)
    }

    pub fn destination_port(&self) -> u16 {
        u16::from_be_bytes(self.destination_port)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
pub struct EthHdr {
    pub dst_addr: [u8; 6],
    pub src_addr: [u8; 6],
    pub ether_type: [u8; 2],
}

impl EthHdr {
    pub const LEN: usize = core::mem::size_of::<EthHdr>();

    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes(self.ether_type)
    }
}

/// Fixed 20 byte IPv4 header, options are never parsed.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
pub struct Ipv4Hdr {
    pub version_ihl: u8,
    pub tos: u8,
    pub tot_len: [u8; 2],
    pub id: [u8; 2],
    pub frag_off: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub check: [u8; 2],
    pub src_addr: [u8; 4],
    pub dst_addr: [u8; 4],
}

impl Ipv4Hdr {
    pub const LEN: usize = core::mem::size_of::<Ipv4Hdr>();

    /// Source address converted from network to host order.
    pub fn src_addr(&self) -> u32 {
        u32::from_be_bytes(self.src_addr)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
pub struct UdpHdr {
    pub source: [u8; 2],
    pub dest: [u8; 2],
    pub len: [u8; 2],
    pub check: [u8; 2],
}

impl UdpHdr {
    pub const LEN: usize = core::mem::size_of::<UdpHdr>();
}
