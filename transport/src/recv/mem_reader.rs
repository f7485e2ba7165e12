use bytes::Bytes;
use tracing::{debug, warn};
use crate::recv::stream::{ReaderControl, Stream, StreamInner, StreamRef};

struct MemReader;

impl ReaderControl for MemReader {
    fn stop(&mut self) {}
}

/// Feeds consecutive packets from `data` to the stream. Decoding ends at the end of the
///  buffer or at the first packet that can not be decoded, since the next packet's start is
///  unknown after that.
fn read_all(inner: &mut StreamInner, data: &[u8]) -> usize {
    let mut offset = 0;
    let mut num_packets = 0;
    while offset < data.len() {
        match inner.add_packet(&data[offset..]) {
            Some(consumed) => {
                offset += consumed;
                num_packets += 1;
            }
            None => {
                warn!("malformed packet at offset {} of {} byte buffer, ignoring the rest", offset, data.len());
                break;
            }
        }
        if inner.is_stopped() {
            break;
        }
    }
    num_packets
}

impl Stream {
    /// Reads packets from a buffer, e.g. one filled by a
    ///  [MemorySink](crate::send::packet_sink::MemorySink). The buffer is processed before this
    ///  returns, and the stream stops afterwards.
    pub fn add_mem_reader(&self, data: impl Into<Bytes>) -> anyhow::Result<()> {
        let data = data.into();
        self.attach_reader(|stream_ref: StreamRef| {
            if let Some(num_packets) = stream_ref.process(|inner| read_all(inner, &data)) {
                debug!("read {} packets from memory", num_packets);
            }
            stream_ref.stop();
            Ok(Box::new(MemReader))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::runtime::Builder;
    use crate::config::ReceiveStreamConfig;
    use crate::recv::stream::tests::{heap_packets, RecordingSink};

    fn run(data: Bytes) -> (RecordingSink, Stream) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let sink = RecordingSink::accepting();
        let stream = Stream::new(rt.handle().clone(), ReceiveStreamConfig::default(), sink.clone()).unwrap();
        stream.add_mem_reader(data).unwrap();
        (sink, stream)
    }

    fn concat(packets: impl IntoIterator<Item = Bytes>) -> BytesMut {
        let mut buf = BytesMut::new();
        for p in packets {
            buf.extend_from_slice(&p);
        }
        buf
    }

    #[test]
    fn test_reads_all_heaps_and_stops() {
        let buf = concat(heap_packets(1, false).into_iter().chain(heap_packets(2, false)));
        let (sink, stream) = run(buf.freeze());

        assert_eq!(sink.cnts(), vec![1, 2]);
        assert!(stream.is_stopped());
        assert_eq!(stream.stats().malformed_packets, 0);
    }

    #[test]
    fn test_stops_at_malformed_packet() {
        let mut buf = concat(heap_packets(1, false));
        buf.extend_from_slice(&[0xff; 16]);
        buf.extend_from_slice(&concat(heap_packets(2, false)));
        let (sink, stream) = run(buf.freeze());

        assert_eq!(sink.cnts(), vec![1]);
        assert_eq!(stream.stats().malformed_packets, 1);
        assert!(stream.is_stopped());
    }

    #[test]
    fn test_truncated_heap_is_incomplete() {
        let packets = heap_packets(1, false);
        let (sink, stream) = run(concat(packets[..packets.len() - 1].iter().cloned()).freeze());

        assert!(sink.cnts().is_empty());
        assert_eq!(stream.stats().heaps_incomplete_at_stop, 1);
    }

    #[test]
    fn test_empty_buffer() {
        let (sink, stream) = run(Bytes::new());
        assert!(sink.cnts().is_empty());
        assert!(stream.is_stopped());
        assert_eq!(sink.num_stopped.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
