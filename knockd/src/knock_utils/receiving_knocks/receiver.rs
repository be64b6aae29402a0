use std::fmt::Write as FmtWrite;
use std::io::Write;
use std::ops::Deref;
use std::os::fd::AsRawFd;
use std::time::Duration;

use aya::maps::ring_buf::RingBufItem as KernelRingItem;
use aya::maps::{MapData, RingBuf};
use knock_common::KnockEvent;
use log::{error, info};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::{Receiver, Sender};
use zerocopy::FromBytes;

use crate::knock_utils::publishing_events::ring_buf::{RingBufItem, RingConsumer};
use crate::knock_utils::shared::types_and_config::{KnockErr, KnockErrWithMsg};

const BATCH_SIZE: usize = 65536;
const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Anything the receive loop can drain knock records from: the kernel ring
/// of the XDP program or the user space ring fed by socket capture.
pub trait KnockSource: AsRawFd {
    type Item<'a>: Deref<Target = [u8]>
    where
        Self: 'a;

    fn next_record(&mut self) -> Option<Self::Item<'_>>;
}

impl KnockSource for RingBuf<MapData> {
    type Item<'a> = KernelRingItem<'a>;

    fn next_record(&mut self) -> Option<Self::Item<'_>> {
        self.next()
    }
}

impl KnockSource for RingConsumer {
    type Item<'a> = RingBufItem<'a>;

    fn next_record(&mut self) -> Option<Self::Item<'_>> {
        self.next()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub read: u64,
    pub lost: u64,
}

pub struct KnockReceiver {
    shutdown: Receiver<String>,
    output_buffer: String,
    output_sender: Sender<String>,
    stats: ReceiveStats,
}

impl KnockReceiver {
    /// Streams every knock as `ip,port` to stdout until `shutdown` fires.
    pub async fn start_receiving<S: KnockSource>(
        source: S,
        shutdown: Receiver<String>,
    ) -> Result<ReceiveStats, KnockErrWithMsg> {
        Self::start_receiving_into(source, shutdown, std::io::stdout()).await
    }

    pub async fn start_receiving_into<S, W>(
        source: S,
        shutdown: Receiver<String>,
        out: W,
    ) -> Result<ReceiveStats, KnockErrWithMsg>
    where
        S: KnockSource,
        W: Write + Send + 'static,
    {
        let (tx_writer, rx_writer) = tokio::sync::mpsc::channel::<String>(2048);

        // Spawn Writer Task
        let writer_handle = tokio::spawn(async move {
            KnockReceiver::run_writer(rx_writer, out).await;
        });

        let mut receiver = Self {
            shutdown,
            output_buffer: String::with_capacity(BATCH_SIZE),
            output_sender: tx_writer,
            stats: ReceiveStats::default(),
        };
        let result = receiver.receive_knocks_loop(source).await;
        let stats = receiver.stats;
        // closes the channel, the writer drains and ends
        drop(receiver);

        if let Err(e) = writer_handle.await {
            error!("{:?}", e);
        }
        result.map(|_| stats)
    }

    async fn receive_knocks_loop<S: KnockSource>(
        &mut self,
        mut source: S,
    ) -> Result<(), KnockErrWithMsg> {
        let async_fd = AsyncFd::new(source.as_raw_fd()).map_err(|e| KnockErrWithMsg {
            err: KnockErr::Receiving,
            msg: format!("failed to register ring buffer fd: {}", e),
        })?;
        let mut flush_interval = tokio::time::interval(FLUSH_INTERVAL);

        let result = loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    // records committed before the signal still count
                    self.drain(&mut source).await;
                    break Ok(());
                }
                _ = flush_interval.tick() => {
                    self.flush_buffer().await;
                }
                guard = async_fd.readable() => {
                    match guard {
                        Ok(mut guard) => {
                            self.drain(&mut source).await;
                            guard.clear_ready();
                        }
                        Err(e) => {
                            break Err(KnockErrWithMsg {
                                err: KnockErr::Receiving,
                                msg: format!("AsyncFd error: {}", e),
                            });
                        }
                    }
                }
            }
        };
        self.flush_buffer().await;
        info!(
            "Knocks lost: {}, Knocks read: {}",
            self.stats.lost, self.stats.read
        );
        result
    }

    async fn drain<S: KnockSource>(&mut self, source: &mut S) {
        loop {
            // the ring item is released before the next await
            let event = match source.next_record() {
                Some(item) => KnockEvent::read_from_bytes(&item).ok(),
                None => break,
            };
            match event {
                Some(event) => {
                    self.stats.read += 1;
                    self.evaluate_knock(&event).await;
                }
                None => self.stats.lost += 1,
            }
        }
    }

    async fn flush_buffer(&mut self) {
        if self.output_buffer.is_empty() {
            return;
        }

        let payload = std::mem::replace(&mut self.output_buffer, String::with_capacity(BATCH_SIZE));

        if let Err(e) = self.output_sender.send(payload).await {
            error!("Error sending to writer task: {}", e);
        }
    }

    async fn run_writer<W: Write>(mut rx: Receiver<String>, mut out: W) {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = out.write_all(chunk.as_bytes()) {
                error!("Error writing knocks: {}", e);
            }
            let _ = out.flush();
        }
    }

    async fn evaluate_knock(&mut self, event: &KnockEvent) {
        info!(
            "knock from {} on port {}",
            event.source_ipv4(),
            event.destination_port()
        );
        format_knock(&mut self.output_buffer, event);

        if self.output_buffer.len() >= BATCH_SIZE {
            self.flush_buffer().await;
        }
    }
}

/// CSV Output: ip,port
pub fn format_knock(buf: &mut String, event: &KnockEvent) {
    let _ = writeln!(buf, "{},{}", event.source_ipv4(), event.destination_port());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knock_utils::inspecting_frames::classifier::inspect;
    use crate::knock_utils::inspecting_frames::frame_walker::tests::build_frame;
    use crate::knock_utils::publishing_events::ring_buf::knock_ring;
    use crate::knock_utils::shared::types_and_config::KnockFilter;
    use knock_common::{BPF_RB_FORCE_WAKEUP, IPPROTO_UDP};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedOut(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedOut {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedOut {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_format_knock_csv() {
        let mut buf = String::new();
        format_knock(&mut buf, &KnockEvent::new(0x0A00_0001, [0xF2, 0xF9]));
        format_knock(&mut buf, &KnockEvent::new(0xC0A8_0102, [0x00, 0x16]));
        assert_eq!(buf, "10.0.0.1,62201\n192.168.1.2,22\n");
    }

    #[tokio::test]
    async fn test_receiver_streams_knocks_until_shutdown() {
        let (producer, consumer) = knock_ring(4096).unwrap();
        let (tx_shutdown, rx_shutdown) = tokio::sync::mpsc::channel::<String>(1);
        let out = SharedOut::default();

        let task = tokio::spawn(KnockReceiver::start_receiving_into(
            consumer,
            rx_shutdown,
            out.clone(),
        ));

        let filter = KnockFilter::default();
        for (src, port) in [([10, 0, 0, 1], 62201), ([10, 0, 0, 2], 7000)] {
            inspect(&build_frame(src, port, IPPROTO_UDP, 0), &filter, &producer);
        }
        // a tcp frame is never published
        inspect(&build_frame([10, 0, 0, 3], 80, 6, 0), &filter, &producer);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx_shutdown.send(String::from("stop")).await.unwrap();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats, ReceiveStats { read: 2, lost: 0 });
        assert_eq!(out.text(), "10.0.0.1,62201\n10.0.0.2,7000\n");
    }

    #[tokio::test]
    async fn test_receiver_flushes_periodically_while_running() {
        let (producer, consumer) = knock_ring(4096).unwrap();
        let (tx_shutdown, rx_shutdown) = tokio::sync::mpsc::channel::<String>(1);
        let out = SharedOut::default();

        let task = tokio::spawn(KnockReceiver::start_receiving_into(
            consumer,
            rx_shutdown,
            out.clone(),
        ));
        inspect(
            &build_frame([10, 0, 0, 9], 4242, IPPROTO_UDP, 0),
            &KnockFilter::default(),
            &producer,
        );

        // a single line never fills a batch, only the flush interval writes it out
        let deadline = tokio::time::Instant::now() + FLUSH_INTERVAL * 5;
        while out.text().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(out.text(), "10.0.0.9,4242\n");
        assert!(!task.is_finished());

        tx_shutdown.send(String::from("stop")).await.unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, ReceiveStats { read: 1, lost: 0 });
        assert_eq!(out.text(), "10.0.0.9,4242\n");
    }

    #[tokio::test]
    async fn test_receiver_counts_malformed_records_as_lost() {
        let (producer, consumer) = knock_ring(4096).unwrap();
        let (tx_shutdown, rx_shutdown) = tokio::sync::mpsc::channel::<String>(1);
        let out = SharedOut::default();

        producer.output(&[1, 2, 3], BPF_RB_FORCE_WAKEUP).unwrap();
        producer
            .output(&[0x7F, 0, 0, 1, 0x1F, 0x90, 0, 0], BPF_RB_FORCE_WAKEUP)
            .unwrap();
        tx_shutdown.send(String::from("stop")).await.unwrap();

        let stats = KnockReceiver::start_receiving_into(consumer, rx_shutdown, out.clone())
            .await
            .unwrap();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.read, 1);
        // the source address is stored in native byte order
        let expected = KnockEvent::new(u32::from_ne_bytes([0x7F, 0, 0, 1]), [0x1F, 0x90]);
        let mut line = String::new();
        format_knock(&mut line, &expected);
        assert_eq!(out.text(), line);
    }
}
