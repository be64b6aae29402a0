use aya::maps::{Array, MapData, RingBuf};
use aya::programs::{Xdp, XdpMode as AyaXdpMode};
use aya::Ebpf;
use aya_log::EbpfLogger;
use knock_common::{
    FILTER_DEBUG, FILTER_SLOTS, FILTER_STRICT_ETHERTYPE, KNOCK_EVENTS_MAP, KNOCK_FILTER_MAP, KNOCK_PROGRAM,
};
use log::{info, warn};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::knock_utils::shared::helper::raise_memlock_rlimit;
use crate::knock_utils::shared::types_and_config::{CaptureConfig, KnockErr, KnockErrWithMsg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpMode {
    Driver,
    Generic,
}

/// Keeps the eBPF object alive, dropping it detaches the program.
pub struct XdpAttachment {
    _ebpf: Ebpf,
    pub mode: XdpMode,
}

/// Loads the knock program, attaches it to `config.interface` and hands out
/// the kernel ring buffer the program publishes into.
pub fn attach_xdp(
    config: &CaptureConfig,
) -> Result<(XdpAttachment, RingBuf<MapData>), KnockErrWithMsg> {
    raise_memlock_rlimit();
    let mut ebpf = load_object(config)?;

    match EbpfLogger::init(&mut ebpf) {
        Err(e) => {
            // This can happen if you remove all log statements from your eBPF program.
            warn!("failed to initialize eBPF logger: {e}");
        }
        Ok(logger) => match AsyncFd::with_interest(logger, Interest::READABLE) {
            Ok(mut logger) => {
                tokio::task::spawn(async move {
                    loop {
                        let Ok(mut guard) = logger.readable_mut().await else {
                            break;
                        };
                        guard.get_inner_mut().flush();
                        guard.clear_ready();
                    }
                });
            }
            Err(e) => warn!("failed to poll eBPF logger: {e}"),
        },
    }

    // maps exist once the object is loaded, the first frame already sees the filter
    write_filter(&mut ebpf, config)?;

    let program: &mut Xdp = ebpf
        .program_mut(KNOCK_PROGRAM)
        .ok_or_else(|| KnockErrWithMsg {
            err: KnockErr::Loading,
            msg: format!("program {} missing in eBPF object", KNOCK_PROGRAM),
        })?
        .try_into()
        .map_err(|e| KnockErrWithMsg {
            err: KnockErr::Loading,
            msg: format!("{} is not an XDP program: {}", KNOCK_PROGRAM, e),
        })?;
    program.load().map_err(|e| KnockErrWithMsg {
        err: KnockErr::Loading,
        msg: format!("verifier rejected {}: {}", KNOCK_PROGRAM, e),
    })?;

    let mode = if config.generic_mode {
        program
            .attach(&config.interface, AyaXdpMode::Skb)
            .map_err(|e| KnockErrWithMsg {
                err: KnockErr::Attaching,
                msg: format!(
                    "failed to attach XDP program to {} in SKB (Generic) mode: {}",
                    config.interface, e
                ),
            })?;
        info!("XDP Mode: SKB (Generic, enforced)");
        XdpMode::Generic
    } else if program
        .attach(&config.interface, AyaXdpMode::Driver)
        .is_ok()
    {
        info!("XDP Mode: Driver (Native, fast)");
        XdpMode::Driver
    } else {
        program
            .attach(&config.interface, AyaXdpMode::Skb)
            .map_err(|e| KnockErrWithMsg {
                err: KnockErr::Attaching,
                msg: format!(
                    "failed to attach XDP program to {} in both Driver and SKB mode: {}",
                    config.interface, e
                ),
            })?;
        warn!("XDP Mode: SKB (Generic, slow)");
        XdpMode::Generic
    };

    let events = ebpf
        .take_map(KNOCK_EVENTS_MAP)
        .ok_or_else(|| KnockErrWithMsg {
            err: KnockErr::Loading,
            msg: format!("map {} missing in eBPF object", KNOCK_EVENTS_MAP),
        })
        .and_then(|map| {
            RingBuf::try_from(map).map_err(|e| KnockErrWithMsg {
                err: KnockErr::Loading,
                msg: format!("{} is not a ring buffer: {}", KNOCK_EVENTS_MAP, e),
            })
        })?;

    Ok((XdpAttachment { _ebpf: ebpf, mode }, events))
}

fn load_object(config: &CaptureConfig) -> Result<Ebpf, KnockErrWithMsg> {
    let loaded = if let Some(path) = &config.bpf_object_path {
        info!("loading eBPF object from {}", path.display());
        Ebpf::load_file(path)
    } else if let Some(object) = embedded_object() {
        Ebpf::load(object)
    } else {
        return Err(KnockErrWithMsg {
            err: KnockErr::Loading,
            msg: String::from(
                "built without an embedded eBPF object, set BpfObjectPath or use --mode socket",
            ),
        });
    };
    loaded.map_err(|e| KnockErrWithMsg {
        err: KnockErr::Loading,
        msg: format!("failed to load eBPF object: {}", e),
    })
}

#[cfg(feature = "embed-ebpf")]
fn embedded_object() -> Option<&'static [u8]> {
    // This will include your eBPF object file as raw bytes at compile-time and load it at runtime
    Some(aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/knock-ebpf")))
}

#[cfg(not(feature = "embed-ebpf"))]
fn embedded_object() -> Option<&'static [u8]> {
    None
}

fn write_filter(ebpf: &mut Ebpf, config: &CaptureConfig) -> Result<(), KnockErrWithMsg> {
    let map = ebpf
        .map_mut(KNOCK_FILTER_MAP)
        .ok_or_else(|| KnockErrWithMsg {
            err: KnockErr::Loading,
            msg: format!("map {} missing in eBPF object", KNOCK_FILTER_MAP),
        })?;
    let mut filter: Array<_, u8> = Array::try_from(map).map_err(|e| KnockErrWithMsg {
        err: KnockErr::Loading,
        msg: format!("{} is not an array: {}", KNOCK_FILTER_MAP, e),
    })?;

    for (slot, value) in filter_slots(config) {
        filter
            .set(slot, value, 0)
            .map_err(|e| KnockErrWithMsg {
                err: KnockErr::Loading,
                msg: format!("failed to write filter slot {}: {}", slot, e),
            })?;
    }
    Ok(())
}

/// `KNOCK_FILTER` contents for `config`, index and value per slot.
fn filter_slots(config: &CaptureConfig) -> [(u32, u8); FILTER_SLOTS as usize] {
    [
        (
            FILTER_STRICT_ETHERTYPE,
            u8::from(config.filter.strict_ether_type),
        ),
        (FILTER_DEBUG, u8::from(config.debug)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knock_utils::shared::types_and_config::{CaptureMode, KnockFilter};

    fn xdp_config(strict_ether_type: bool, debug: bool) -> CaptureConfig {
        CaptureConfig {
            interface: String::from("lo"),
            capture_mode: CaptureMode::Xdp,
            bpf_object_path: None,
            generic_mode: false,
            filter: KnockFilter { strict_ether_type },
            ring_byte_size: 4096,
            capture_threads: 1,
            debug,
        }
    }

    #[test]
    fn test_filter_slots_cover_every_slot() {
        let slots = filter_slots(&xdp_config(false, false));
        let mut indices: Vec<u32> = slots.iter().map(|(slot, _)| *slot).collect();
        indices.sort();
        assert_eq!(indices, (0..FILTER_SLOTS).collect::<Vec<_>>());
        assert!(slots.iter().all(|(_, value)| *value == 0));
    }

    #[test]
    fn test_filter_slots_follow_config() {
        let slots = filter_slots(&xdp_config(true, false));
        assert!(slots.contains(&(FILTER_STRICT_ETHERTYPE, 1)));
        assert!(slots.contains(&(FILTER_DEBUG, 0)));

        let slots = filter_slots(&xdp_config(false, true));
        assert!(slots.contains(&(FILTER_STRICT_ETHERTYPE, 0)));
        assert!(slots.contains(&(FILTER_DEBUG, 1)));
    }

    #[test]
    fn test_missing_object_fails_before_attaching() {
        let mut config = xdp_config(false, false);
        config.bpf_object_path = Some(std::path::PathBuf::from("/nonexistent/knock-ebpf.o"));
        let err = load_object(&config).err().expect("missing object must fail");
        assert_eq!(err.err, KnockErr::Loading);
    }
}
