use knock_common::{BPF_RB_FORCE_WAKEUP, KnockEvent};

use crate::knock_utils::inspecting_frames::frame_walker::{self, FrameHeaders};
use crate::knock_utils::publishing_events::ring_buf::RingBufErr;
use crate::knock_utils::shared::types_and_config::KnockFilter;

/// Outcome for the receive path. Frames are only observed, never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
}

/// Destination of knock events, the user space twin of `bpf_ringbuf_output`.
pub trait KnockSink {
    fn output(&self, event: &KnockEvent, flags: u64) -> Result<(), RingBufErr>;
}

#[inline]
pub fn knock_from_headers(headers: &FrameHeaders<'_>) -> KnockEvent {
    // address to host order, port deliberately left in network order
    KnockEvent::new(headers.ipv4.src_addr(), headers.udp.dest)
}

#[inline]
pub fn classify(frame: &[u8], filter: &KnockFilter) -> Option<KnockEvent> {
    frame_walker::walk(frame, filter).map(|headers| knock_from_headers(&headers))
}

/// Per frame entry point. Publishes a knock if the frame is one and lets the
/// frame pass in every case; a full sink loses the knock, nothing else.
#[inline]
pub fn inspect<S: KnockSink + ?Sized>(frame: &[u8], filter: &KnockFilter, sink: &S) -> Verdict {
    if let Some(knock) = classify(frame, filter) {
        let _ = sink.output(&knock, BPF_RB_FORCE_WAKEUP);
    }
    Verdict::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knock_utils::inspecting_frames::frame_walker::tests::{build_frame, knock_frame};
    use crate::knock_utils::publishing_events::ring_buf::knock_ring;
    use knock_common::IPPROTO_UDP;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use zerocopy::FromBytes;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(KnockEvent, u64)>>,
    }

    impl KnockSink for RecordingSink {
        fn output(&self, event: &KnockEvent, flags: u64) -> Result<(), RingBufErr> {
            self.events.lock().unwrap().push((*event, flags));
            Ok(())
        }
    }

    struct FullSink;

    impl KnockSink for FullSink {
        fn output(&self, _event: &KnockEvent, _flags: u64) -> Result<(), RingBufErr> {
            Err(RingBufErr::Full)
        }
    }

    #[test]
    fn test_inspect_emits_knock() {
        let sink = RecordingSink::default();
        let verdict = inspect(&knock_frame(), &KnockFilter::default(), &sink);
        assert_eq!(verdict, Verdict::Pass);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (event, flags) = events[0];
        assert_eq!(event.source_address, 0x0A00_0001);
        assert_eq!(event.destination_port, 62201u16.to_be_bytes());
        assert_eq!(event.padding, [0, 0]);
        assert_eq!(flags, BPF_RB_FORCE_WAKEUP);
    }

    #[test]
    fn test_inspect_wrong_protocol_emits_nothing() {
        let sink = RecordingSink::default();
        let frame = build_frame([10, 0, 0, 1], 62201, 6, 0);
        assert_eq!(inspect(&frame, &KnockFilter::default(), &sink), Verdict::Pass);
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_inspect_oversized_emits_nothing() {
        let sink = RecordingSink::default();
        let frame = build_frame([10, 0, 0, 1], 62201, IPPROTO_UDP, 19);
        assert_eq!(inspect(&frame, &KnockFilter::default(), &sink), Verdict::Pass);
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_inspect_truncated_passes() {
        let sink = RecordingSink::default();
        let frame = knock_frame();
        for len in 0..frame.len() {
            assert_eq!(inspect(&frame[..len], &KnockFilter::default(), &sink), Verdict::Pass);
        }
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_inspect_full_sink_still_passes() {
        assert_eq!(
            inspect(&knock_frame(), &KnockFilter::default(), &FullSink),
            Verdict::Pass
        );
    }

    #[test]
    fn test_classify_matches_headers() {
        let frame = build_frame([192, 0, 2, 33], 7000, IPPROTO_UDP, 0);
        let knock = classify(&frame, &KnockFilter::default()).unwrap();
        assert_eq!(knock.source_ipv4(), Ipv4Addr::new(192, 0, 2, 33));
        assert_eq!(knock.destination_port(), 7000);
    }

    #[test]
    fn test_concurrent_inspect_into_ring() {
        const PRODUCERS: u32 = 64;
        let (producer, mut consumer) = knock_ring(1 << 24).unwrap();

        std::thread::scope(|scope| {
            for i in 0..PRODUCERS {
                let producer = producer.clone();
                scope.spawn(move || {
                    let src = [10, 1, (i >> 8) as u8, i as u8];
                    let frame = build_frame(src, 1000 + i as u16, IPPROTO_UDP, 0);
                    inspect(&frame, &KnockFilter::default(), &producer)
                });
            }
        });

        let mut seen = HashSet::new();
        while let Some(item) = consumer.next() {
            assert_eq!(item.len(), KnockEvent::LEN);
            let event = KnockEvent::read_from_bytes(&item).unwrap();
            assert_eq!(event.padding, [0, 0]);
            let octets = event.source_ipv4().octets();
            let i = (u32::from(octets[2]) << 8) | u32::from(octets[3]);
            assert_eq!(octets[..2], [10, 1]);
            assert_eq!(event.destination_port(), 1000 + i as u16);
            assert!(seen.insert(i), "record {} seen twice", i);
        }
        assert_eq!(seen.len(), PRODUCERS as usize);
    }

    #[test]
    fn test_inspect_beyond_ring_capacity() {
        // room for four 16 byte records
        let (producer, mut consumer) = knock_ring(64).unwrap();
        for port in 0..10u16 {
            let frame = build_frame([10, 0, 0, 1], port, IPPROTO_UDP, 0);
            assert_eq!(inspect(&frame, &KnockFilter::default(), &producer), Verdict::Pass);
        }

        let mut ports = Vec::new();
        while let Some(item) = consumer.next() {
            ports.push(KnockEvent::read_from_bytes(&item).unwrap().destination_port());
        }
        assert_eq!(ports, vec![0, 1, 2, 3]);
    }
}
