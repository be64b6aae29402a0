use knock_common::{ETHERTYPE_IPV4, EthHdr, IPPROTO_UDP, Ipv4Hdr, KNOCK_MAX_FRAME_LEN, UdpHdr};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::knock_utils::shared::types_and_config::KnockFilter;

/// Header views over one borrowed frame, only built after each header was
/// found completely inside the frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeaders<'a> {
    pub eth: &'a EthHdr,
    pub ipv4: &'a Ipv4Hdr,
    pub udp: &'a UdpHdr,
    pub frame_len: usize,
}

/// Slice counterpart of the eBPF `ptr_at`: `None` unless
/// `[offset, offset + size_of::<T>())` lies inside `frame`.
#[inline(always)]
fn header_at<T>(frame: &[u8], offset: usize) -> Option<&T>
where
    T: FromBytes + KnownLayout + Immutable + Unaligned,
{
    let end = offset.checked_add(core::mem::size_of::<T>())?;
    let bytes = frame.get(offset..end)?;
    T::ref_from_bytes(bytes).ok()
}

/// Walks link, network and transport header of a candidate knock frame.
///
/// Every guard short circuits, there is no loop and no variable length
/// field, so the work per frame is a handful of comparisons.
#[inline]
pub fn walk<'a>(frame: &'a [u8], filter: &KnockFilter) -> Option<FrameHeaders<'a>> {
    let frame_len = frame.len();
    // a knock carries no payload
    if frame_len > KNOCK_MAX_FRAME_LEN {
        return None;
    }

    let eth: &EthHdr = header_at(frame, 0)?;
    if filter.strict_ether_type && eth.ether_type() != ETHERTYPE_IPV4 {
        return None;
    }

    // the complete fixed header is in bounds before proto is looked at
    let ipv4: &Ipv4Hdr = header_at(frame, EthHdr::LEN)?;
    if ipv4.proto != IPPROTO_UDP {
        return None;
    }

    let udp: &UdpHdr = header_at(frame, EthHdr::LEN + Ipv4Hdr::LEN)?;

    Some(FrameHeaders {
        eth,
        ipv4,
        udp,
        frame_len,
    })
}
