#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{Array, RingBuf},
    programs::XdpContext,
};
use aya_log_ebpf::info;
use core::mem;
use knock_common::{
    BPF_RB_FORCE_WAKEUP, ETHERTYPE_IPV4, EthHdr, FILTER_DEBUG, FILTER_SLOTS,
    FILTER_STRICT_ETHERTYPE, IPPROTO_UDP, Ipv4Hdr, KNOCK_MAX_FRAME_LEN, KNOCK_RING_BYTE_SIZE,
    KnockEvent, UdpHdr,
};

#[map(name = "KNOCK_EVENTS")]
static KNOCK_EVENTS: RingBuf = RingBuf::with_byte_size(KNOCK_RING_BYTE_SIZE, 0); // 16MB RingBuf

// 0: strict ethertype, 1: debug logs
#[map(name = "KNOCK_FILTER")]
static KNOCK_FILTER: Array<u8> = Array::with_max_entries(FILTER_SLOTS, 0);

#[xdp]
pub fn knock_xdp(ctx: XdpContext) -> u32 {
    // observe only, every frame continues up the stack
    let _ = try_knock_xdp(&ctx);
    xdp_action::XDP_PASS
}

#[inline(always)]
fn filter_enabled(slot: u32) -> bool {
    *KNOCK_FILTER.get(slot).unwrap_or(&0) != 0
}

#[inline(always)]
unsafe fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    let len = mem::size_of::<T>();
    if start + offset + len > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

fn try_knock_xdp(ctx: &XdpContext) -> Result<(), ()> {
    let debug = filter_enabled(FILTER_DEBUG);

    let frame_len = ctx.data_end() - ctx.data();
    if frame_len > KNOCK_MAX_FRAME_LEN {
        return Ok(());
    }

    let ethhdr: *const EthHdr = match unsafe { ptr_at(ctx, 0) } {
        Ok(hdr) => hdr,
        Err(_) => {
            if debug {
                info!(ctx, "pass: eth truncated, len={}", frame_len);
            }
            return Err(());
        }
    };

    if filter_enabled(FILTER_STRICT_ETHERTYPE) {
        let ether_type = u16::from_be_bytes(unsafe { (*ethhdr).ether_type });
        if ether_type != ETHERTYPE_IPV4 {
            if debug {
                info!(ctx, "pass: non ipv4 eth: {:x}", ether_type);
            }
            return Ok(());
        }
    }

    // the whole fixed header is checked before proto is read
    let ip_hdr: *const Ipv4Hdr = match unsafe { ptr_at(ctx, EthHdr::LEN) } {
        Ok(hdr) => hdr,
        Err(_) => {
            if debug {
                info!(ctx, "pass: v4 truncated, len={}", frame_len);
            }
            return Err(());
        }
    };

    let proto = unsafe { (*ip_hdr).proto };
    if proto != IPPROTO_UDP {
        if debug {
            info!(ctx, "pass: v4 non-udp: {}", proto);
        }
        return Ok(());
    }

    let udp_hdr: *const UdpHdr = match unsafe { ptr_at(ctx, EthHdr::LEN + Ipv4Hdr::LEN) } {
        Ok(hdr) => hdr,
        Err(_) => {
            if debug {
                info!(ctx, "pass: udp truncated, len={}", frame_len);
            }
            return Err(());
        }
    };

    let src_addr = u32::from_be_bytes(unsafe { (*ip_hdr).src_addr });
    // port stays in network order
    let dst_port = unsafe { (*udp_hdr).dest };

    let knock = KnockEvent::new(src_addr, dst_port);
    // a full ring drops the knock, the receive path never waits for the consumer
    if KNOCK_EVENTS.output(&knock, BPF_RB_FORCE_WAKEUP).is_err() && debug {
        info!(ctx, "drop: ring full, src={:i}", src_addr);
    }

    Ok(())
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
