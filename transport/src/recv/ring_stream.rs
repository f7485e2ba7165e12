use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};
use crate::config::ReceiveStreamConfig;
use crate::recv::completed_heap::CompletedHeap;
use crate::recv::reassembly::StreamStats;
use crate::recv::stream::{HeapSink, Stream};
use crate::recv::Stopped;

struct RingSink {
    heaps: Option<mpsc::Sender<CompletedHeap>>,
}

impl HeapSink for RingSink {
    fn heap_ready(&mut self, heap: CompletedHeap) -> bool {
        let Some(heaps) = &self.heaps else {
            return false;
        };
        match heaps.try_send(heap) {
            Ok(()) => true,
            Err(TrySendError::Full(heap)) => {
                warn!("no room for completed heap {}, dropping it", heap.cnt());
                false
            }
            Err(TrySendError::Closed(heap)) => {
                debug!("ring stream gone, dropping heap {}", heap.cnt());
                false
            }
        }
    }

    fn stream_stopped(&mut self) {
        // consumers see the end once they took all queued heaps
        self.heaps = None;
    }
}

/// A receive stream with a bounded queue of completed heaps for the consumer to take from.
///
/// When the queue is full, newly completed heaps are dropped and counted in
///  [StreamStats::heaps_dropped_ring_full].
pub struct RingStream {
    stream: Stream,
    heaps: mpsc::Receiver<CompletedHeap>,
}

impl RingStream {
    pub fn new(runtime: Handle, config: ReceiveStreamConfig) -> anyhow::Result<RingStream> {
        config.validate()?;
        let (sender, heaps) = mpsc::channel(config.ring_heaps);
        let stream = Stream::new(runtime, config, RingSink { heaps: Some(sender) })?;
        Ok(RingStream { stream, heaps })
    }

    /// The underlying stream, for attaching readers and stopping
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    /// Waits for the next completed heap
    pub async fn pop(&mut self) -> Result<CompletedHeap, Stopped> {
        self.heaps.recv().await.ok_or(Stopped)
    }

    /// Returns the next completed heap if there is one
    pub fn try_pop(&mut self) -> Result<Option<CompletedHeap>, Stopped> {
        match self.heaps.try_recv() {
            Ok(heap) => Ok(Some(heap)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Stopped),
        }
    }

    pub fn stop(&self) {
        self.stream.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::runtime::Builder;
    use crate::recv::stream::tests::heap_packets;

    fn packets_for(cnts: &[u64], end: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        for (i, &cnt) in cnts.iter().enumerate() {
            for p in heap_packets(cnt, end && i == cnts.len() - 1) {
                buf.extend_from_slice(&p);
            }
        }
        buf
    }

    #[test]
    fn test_pop_until_stopped() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut ring = RingStream::new(Handle::current(), ReceiveStreamConfig::default()).unwrap();
            ring.stream().add_mem_reader(packets_for(&[1, 2, 3], false).freeze()).unwrap();

            assert_eq!(ring.pop().await.unwrap().cnt(), 1);
            assert_eq!(ring.pop().await.unwrap().cnt(), 2);
            assert_eq!(ring.pop().await.unwrap().cnt(), 3);
            assert_eq!(ring.pop().await.unwrap_err(), Stopped);
        });
    }

    #[test]
    fn test_full_ring_drops_heaps() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let config = ReceiveStreamConfig { ring_heaps: 2, ..Default::default() };
        let mut ring = RingStream::new(rt.handle().clone(), config).unwrap();
        ring.stream().add_mem_reader(packets_for(&[1, 2, 3, 4], false).freeze()).unwrap();

        assert_eq!(ring.stats().heaps_completed, 4);
        assert_eq!(ring.stats().heaps_dropped_ring_full, 2);
        assert_eq!(ring.try_pop().unwrap().unwrap().cnt(), 1);
        assert_eq!(ring.try_pop().unwrap().unwrap().cnt(), 2);
        assert_eq!(ring.try_pop().unwrap_err(), Stopped);
    }

    #[test]
    fn test_try_pop_empty() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let mut ring = RingStream::new(rt.handle().clone(), ReceiveStreamConfig::default()).unwrap();
        assert_eq!(ring.try_pop().unwrap().map(|h| h.cnt()), None);

        ring.stop();
        assert_eq!(ring.try_pop().unwrap_err(), Stopped);
    }

    #[test]
    fn test_end_of_stream_heap_is_last() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut ring = RingStream::new(Handle::current(), ReceiveStreamConfig::default()).unwrap();
            let mut buf = packets_for(&[1, 2], true);
            buf.extend_from_slice(&packets_for(&[3], false));
            ring.stream().add_mem_reader(buf.freeze()).unwrap();

            assert_eq!(ring.pop().await.unwrap().cnt(), 1);
            let last = ring.pop().await.unwrap();
            assert_eq!(last.cnt(), 2);
            assert!(last.is_end_of_stream());
            assert!(ring.pop().await.is_err());
        });
    }
}
