use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::socket::{
    AddressFamily, LinkAddr, SockFlag, SockaddrLike, SockProtocol, SockType, bind, recvfrom, socket,
};

use crate::knock_utils::inspecting_frames::classifier::{KnockSink, inspect};
use crate::knock_utils::shared::helper::find_interface_index_by_name;
use crate::knock_utils::shared::types_and_config::{
    CaptureConfig, KnockErr, KnockErrWithMsg, KnockFilter,
};

// linux/if_packet.h
const PACKET_OUTGOING: u8 = 4;
const PACKET_FANOUT: libc::c_int = 18;
const PACKET_FANOUT_HASH: u32 = 0;

// anything longer than a knock is dropped anyway, the buffer only has to
// be large enough to notice the excess
const RECV_BUF_LEN: usize = 2048;
const RECV_TIMEOUT_MICROS: libc::suseconds_t = 100_000;
const RECV_SOCKET_BUF: i32 = 32 * 1024 * 1024;

/// AF_PACKET capture for hosts without XDP support. Every thread owns one
/// socket of a fanout group and feeds the frames it sees through the
/// classifier into the shared sink.
pub struct FrameCapture {
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

struct Cleanup {
    stop: Arc<AtomicBool>,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl FrameCapture {
    pub fn start<S>(config: &CaptureConfig, sink: S) -> Result<Self, KnockErrWithMsg>
    where
        S: KnockSink + Clone + Send + 'static,
    {
        let ifindex = find_interface_index_by_name(&config.interface).ok_or(KnockErrWithMsg {
            err: KnockErr::Socket,
            msg: format!("Error finding interface index of {}", config.interface),
        })?;
        let core_ids = core_affinity::get_core_ids().ok_or(KnockErrWithMsg {
            err: KnockErr::Config,
            msg: "Could not retrieve core IDs for thread pinning".to_string(),
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let mut capture = Self {
            stop: stop.clone(),
            frames: frames.clone(),
            handles: Vec::with_capacity(config.capture_threads),
        };
        let fanout_group = std::process::id() as u16;

        for thread_idx in 0..config.capture_threads {
            let fd = create_afp_socket()?;
            let link_addr = initialize_sock_addr(ifindex)?;
            bind(fd.as_raw_fd(), &link_addr).map_err(|e| KnockErrWithMsg {
                err: KnockErr::Socket,
                msg: format!("Error binding to {}: {:?}", config.interface, e),
            })?;
            if config.capture_threads > 1 {
                join_fanout(fd.as_raw_fd(), fanout_group)?;
            }

            let core_id = *core_ids
                .get(thread_idx % core_ids.len())
                .ok_or(KnockErrWithMsg {
                    err: KnockErr::Config,
                    msg: "Core ID List is empty".to_string(),
                })?;
            let sink = sink.clone();
            let filter = config.filter;
            let stop = stop.clone();
            let frames = frames.clone();

            let handle = thread::Builder::new()
                .name(format!("knock-capture-{}", thread_idx))
                .spawn(move || {
                    core_affinity::set_for_current(core_id);
                    // a dying capture thread takes the others down with it
                    let cleanup = Cleanup { stop };
                    if let Err(e) = capture_loop(fd, &filter, &sink, &cleanup.stop, &frames) {
                        error!("{}", e);
                    }
                })
                .map_err(|e| KnockErrWithMsg {
                    err: KnockErr::Capturing,
                    msg: format!("Error spawning capture thread: {}", e),
                })?;
            capture.handles.push(handle);
        }

        info!(
            "capturing on {} with {} AF_PACKET socket(s)",
            config.interface, config.capture_threads
        );
        Ok(capture)
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Signals every thread and waits until the sockets are closed.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
        }
        debug!("capture stopped after {} frames", self.frames_seen());
    }
}

impl Drop for FrameCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn capture_loop<S: KnockSink>(
    fd: OwnedFd,
    filter: &KnockFilter,
    sink: &S,
    stop: &AtomicBool,
    frames: &AtomicU64,
) -> Result<(), KnockErrWithMsg> {
    let raw_fd = fd.as_raw_fd();
    let mut buf = [0u8; RECV_BUF_LEN];

    while !stop.load(Ordering::Relaxed) {
        match recvfrom::<LinkAddr>(raw_fd, &mut buf) {
            Ok((len, addr)) => {
                if addr.is_some_and(|addr| addr.pkttype() == PACKET_OUTGOING) {
                    continue;
                }
                frames.fetch_add(1, Ordering::Relaxed);
                inspect(&buf[..len], filter, sink);
            }
            // receive timeout, look at the stop flag again
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(KnockErrWithMsg {
                    err: KnockErr::Capturing,
                    msg: format!("Error receiving frame {:?}", e),
                });
            }
        }
    }
    Ok(())
}

fn create_afp_socket() -> Result<OwnedFd, KnockErrWithMsg> {
    let fd = match socket(
        AddressFamily::Packet, // AF_PACKET
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::EthAll,
    ) {
        Ok(fd) => fd,
        Err(e) => {
            return Err(KnockErrWithMsg {
                err: KnockErr::Socket,
                msg: format!("Error creating file description {:?}", e),
            });
        }
    };

    unsafe {
        let raw_fd = fd.as_raw_fd();

        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: RECV_TIMEOUT_MICROS,
        };
        let ret = libc::setsockopt(
            raw_fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
        if ret < 0 {
            // without a timeout the thread only notices the stop flag on traffic
            return Err(KnockErrWithMsg {
                err: KnockErr::Socket,
                msg: format!("Error setting SO_RCVTIMEO {:?}", Errno::last()),
            });
        }

        let ret_rcvbuf = libc::setsockopt(
            raw_fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &RECV_SOCKET_BUF as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        );
        if ret_rcvbuf < 0 {
            warn!("Could not set SO_RCVBUF");
        }
    }

    Ok(fd)
}

fn initialize_sock_addr(ifindex: u32) -> Result<LinkAddr, KnockErrWithMsg> {
    let sock_addr = libc::sockaddr_ll {
        sll_family: libc::AF_PACKET as u16,
        sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
        sll_ifindex: ifindex as i32,
        sll_hatype: 0,
        sll_pkttype: 0,
        sll_halen: 0,
        sll_addr: [0; 8],
    };

    // unsafe, because of libc usage, functionallity currently not supported by pure rust crates
    unsafe { LinkAddr::from_raw(&sock_addr as *const _ as *const libc::sockaddr, None) }.ok_or_else(
        || KnockErrWithMsg {
            err: KnockErr::Socket,
            msg: String::from("Failed to create LinkAddr"),
        },
    )
}

fn fanout_arg(group: u16) -> u32 {
    u32::from(group) | (PACKET_FANOUT_HASH << 16)
}

/// Spreads frames over the group by flow hash, so one flow never hits two threads.
fn join_fanout(raw_fd: RawFd, group: u16) -> Result<(), KnockErrWithMsg> {
    let arg = fanout_arg(group);
    let ret = unsafe {
        libc::setsockopt(
            raw_fd,
            libc::SOL_PACKET,
            PACKET_FANOUT,
            &arg as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(KnockErrWithMsg {
            err: KnockErr::Socket,
            msg: format!("Error joining fanout group {} {:?}", group, Errno::last()),
        });
    }
    Ok(())
}
