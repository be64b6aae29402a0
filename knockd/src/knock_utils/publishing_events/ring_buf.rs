//! Multi producer, single consumer byte ring for knock records.
//!
//! Framing follows the kernel BPF ring buffer: every record starts with an
//! 8 byte header word (commit bit + payload length) followed by the payload
//! padded to 8 bytes. Producers reserve space with a compare-and-swap on the
//! producer position, copy their payload and commit the header with release
//! ordering, so concurrent records never share a byte. The consumer hands out
//! records in reservation order and stops at the first one that is reserved
//! but not yet committed.

use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use knock_common::{BPF_RB_FORCE_WAKEUP, BPF_RB_NO_WAKEUP, KnockEvent};
use nix::sys::eventfd::{EfdFlags, EventFd};
use zerocopy::IntoBytes;

use crate::knock_utils::inspecting_frames::classifier::KnockSink;
use crate::knock_utils::shared::types_and_config::{KnockErr, KnockErrWithMsg};

const HDR_LEN: u64 = 8;
const COMMIT_BIT: u64 = 1 << 63;
const LEN_MASK: u64 = u32::MAX as u64;
// lost reservation races before a record is given up, keeps output() bounded
const RESERVE_ATTEMPTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufErr {
    /// the consumer has not released enough space
    Full,
    /// other producers kept winning the reservation
    Contended,
    TooLarge,
    Empty,
}

struct RingShared {
    words: Box<[AtomicU64]>,
    word_mask: u64,
    byte_size: u64,
    producer_pos: AtomicU64,
    consumer_pos: AtomicU64,
    wakeup: EventFd,
}

impl RingShared {
    #[inline(always)]
    fn word(&self, pos: u64) -> &AtomicU64 {
        &self.words[((pos / 8) & self.word_mask) as usize]
    }

    #[inline]
    fn reserve(&self, total: u64) -> Result<u64, RingBufErr> {
        self.reserve_within(total, RESERVE_ATTEMPTS)
    }

    /// Gives up with `Contended` after `attempts` lost compare-and-swaps.
    #[inline]
    fn reserve_within(&self, total: u64, attempts: usize) -> Result<u64, RingBufErr> {
        let mut head = self.producer_pos.load(Ordering::Relaxed);
        for _ in 0..attempts {
            let tail = self.consumer_pos.load(Ordering::Acquire);
            // a stale head may lag behind tail, the cas below rejects it then
            if head.saturating_sub(tail) + total > self.byte_size {
                return Err(RingBufErr::Full);
            }
            match self.producer_pos.compare_exchange(
                head,
                head + total,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(head),
                Err(current) => head = current,
            }
        }
        Err(RingBufErr::Contended)
    }

    #[inline]
    fn write_payload(&self, pos: u64, data: &[u8]) {
        for (i, chunk) in data.chunks(8).enumerate() {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.word(pos + HDR_LEN + 8 * i as u64)
                .store(u64::from_ne_bytes(word), Ordering::Relaxed);
        }
    }

    #[inline]
    fn commit(&self, pos: u64, len: usize) {
        self.word(pos)
            .store(COMMIT_BIT | len as u64, Ordering::Release);
    }

    #[inline]
    fn wake(&self) {
        // EAGAIN only on counter overflow, the consumer is awake then anyway
        let _ = self.wakeup.write(1);
    }
}

#[inline(always)]
fn record_len(payload_len: usize) -> u64 {
    HDR_LEN + (payload_len as u64).div_ceil(8) * 8
}

/// Creates the channel. `byte_size` must be a power of two and at least 16.
pub fn knock_ring(byte_size: usize) -> Result<(RingProducer, RingConsumer), KnockErrWithMsg> {
    if !byte_size.is_power_of_two() || byte_size < 16 {
        return Err(KnockErrWithMsg {
            err: KnockErr::Config,
            msg: format!("ring byte size must be a power of two >= 16, got {}", byte_size),
        });
    }
    let wakeup = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
        .map_err(|e| KnockErrWithMsg {
            err: KnockErr::Receiving,
            msg: format!("Error creating ring wakeup eventfd {:?}", e),
        })?;

    let word_count = byte_size / 8;
    let words: Box<[AtomicU64]> = (0..word_count).map(|_| AtomicU64::new(0)).collect();
    let shared = Arc::new(RingShared {
        words,
        word_mask: word_count as u64 - 1,
        byte_size: byte_size as u64,
        producer_pos: AtomicU64::new(0),
        consumer_pos: AtomicU64::new(0),
        wakeup,
    });

    Ok((
        RingProducer {
            shared: shared.clone(),
        },
        RingConsumer {
            shared,
            scratch: Vec::with_capacity(KnockEvent::LEN),
        },
    ))
}

/// Writing end, cheap to clone into every receive thread.
#[derive(Clone)]
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    /// Appends one record without blocking or allocating.
    ///
    /// `flags` follow `bpf_ringbuf_output`: `BPF_RB_FORCE_WAKEUP` always
    /// signals the consumer, `BPF_RB_NO_WAKEUP` never does, anything else
    /// signals only a consumer that already caught up to this record.
    pub fn output(&self, data: &[u8], flags: u64) -> Result<(), RingBufErr> {
        if data.is_empty() {
            return Err(RingBufErr::Empty);
        }
        let total = record_len(data.len());
        if total > self.shared.byte_size || data.len() as u64 > LEN_MASK {
            return Err(RingBufErr::TooLarge);
        }

        let pos = self.shared.reserve(total)?;
        self.shared.write_payload(pos, data);
        self.shared.commit(pos, data.len());

        if flags & BPF_RB_FORCE_WAKEUP != 0 {
            self.shared.wake();
        } else if flags & BPF_RB_NO_WAKEUP == 0
            && self.shared.consumer_pos.load(Ordering::Acquire) == pos
        {
            self.shared.wake();
        }
        Ok(())
    }

    pub fn byte_size(&self) -> usize {
        self.shared.byte_size as usize
    }
}

impl KnockSink for RingProducer {
    #[inline]
    fn output(&self, event: &KnockEvent, flags: u64) -> Result<(), RingBufErr> {
        RingProducer::output(self, event.as_bytes(), flags)
    }
}

/// Reading end. There is exactly one per ring.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    scratch: Vec<u8>,
}

pub struct RingBufItem<'a> {
    data: &'a [u8],
}

impl Deref for RingBufItem<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl RingConsumer {
    /// Next committed record, `None` when the ring is drained or the oldest
    /// reservation is still being written.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<RingBufItem<'_>> {
        let shared = &self.shared;
        let tail = shared.consumer_pos.load(Ordering::Relaxed);
        let mut header = shared.word(tail).load(Ordering::Acquire);
        if header & COMMIT_BIT == 0 {
            // reset readiness, then look again so a commit racing the reset is not lost
            let _ = shared.wakeup.read();
            header = shared.word(tail).load(Ordering::Acquire);
            if header & COMMIT_BIT == 0 {
                return None;
            }
        }

        let len = (header & LEN_MASK) as usize;
        let total = record_len(len);
        self.scratch.clear();
        let mut pos = tail + HDR_LEN;
        while pos < tail + total {
            let word = shared.word(pos);
            self.scratch
                .extend_from_slice(&word.load(Ordering::Relaxed).to_ne_bytes());
            // a later record may put its header here
            word.store(0, Ordering::Relaxed);
            pos += 8;
        }
        self.scratch.truncate(len);
        shared.word(tail).store(0, Ordering::Relaxed);
        shared
            .consumer_pos
            .store(tail + total, Ordering::Release);

        Some(RingBufItem {
            data: &self.scratch,
        })
    }
}

/// Readable whenever a producer asked for a wakeup, for `AsyncFd`.
impl AsRawFd for RingConsumer {
    fn as_raw_fd(&self) -> RawFd {
        self.shared.wakeup.as_fd().as_raw_fd()
    }
}
