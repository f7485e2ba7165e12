use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use anyhow::bail;
use tokio::runtime::Handle;
use tracing::{debug, info};
use crate::config::ReceiveStreamConfig;
use crate::recv::completed_heap::CompletedHeap;
use crate::recv::reassembly::{Reassembler, StreamStats};

/// Consumer of the heaps a stream completes.
///
/// The sink is called while the stream is locked, from whichever thread a reader runs on. It
///  must not block, and it must not call back into the stream.
pub trait HeapSink: Send + 'static {
    /// Takes a completed heap. Returning `false` means the heap was dropped, which the stream
    ///  counts.
    fn heap_ready(&mut self, heap: CompletedHeap) -> bool;

    /// Called once, after the stream stopped. No heaps follow.
    fn stream_stopped(&mut self);
}

/// A reader's handle for shutting it down. `stop` is called with the stream locked; once it
///  returns, the reader must not hand any more packets to the stream.
pub(crate) trait ReaderControl: Send {
    fn stop(&mut self);
}

pub(crate) struct StreamInner {
    reassembler: Reassembler,
    sink: Box<dyn HeapSink>,
    readers: Vec<Box<dyn ReaderControl>>,
    /// readers that were attached and did not finish on their own yet
    active_readers: usize,
    stopped: bool,
}

impl StreamInner {
    /// Adds the packet at the start of `buf`, returning its length if it could be decoded
    pub(crate) fn add_packet(&mut self, buf: &[u8]) -> Option<usize> {
        let (consumed, completed) = self.reassembler.add_raw_packet(buf);
        if let Some(heap) = completed {
            self.deliver(heap);
        }
        consumed
    }

    pub(crate) fn stats_mut(&mut self) -> &mut StreamStats {
        self.reassembler.stats_mut()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn deliver(&mut self, heap: CompletedHeap) {
        let end_of_stream = heap.is_end_of_stream();
        if end_of_stream && heap.is_empty() {
            debug!("end of stream marker in heap {}", heap.cnt());
        }
        else if !self.sink.heap_ready(heap) {
            self.reassembler.stats_mut().heaps_dropped_ring_full += 1;
        }

        if end_of_stream {
            self.stop();
        }
    }

    pub(crate) fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for mut reader in self.readers.drain(..) {
            reader.stop();
        }
        self.reassembler.discard_incomplete();
        self.sink.stream_stopped();
        info!("receive stream stopped: {:?}", self.reassembler.stats());
    }
}

fn lock(inner: &Mutex<StreamInner>) -> MutexGuard<StreamInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A reader's reference to its stream. It does not keep the stream alive.
#[derive(Clone)]
pub(crate) struct StreamRef(Weak<Mutex<StreamInner>>);

impl StreamRef {
    /// Runs `f` with the stream locked. Returns `None` without calling `f` if the stream stopped
    ///  or was dropped.
    pub(crate) fn process<R>(&self, f: impl FnOnce(&mut StreamInner) -> R) -> Option<R> {
        let inner = self.0.upgrade()?;
        let mut inner = lock(&inner);
        if inner.stopped {
            return None;
        }
        Some(f(&mut inner))
    }

    /// A reader calls this when it ends on its own. The stream stops when the last reader is
    ///  finished.
    pub(crate) fn reader_finished(&self) {
        if let Some(inner) = self.0.upgrade() {
            let mut inner = lock(&inner);
            inner.active_readers = inner.active_readers.saturating_sub(1);
            if inner.active_readers == 0 {
                debug!("last reader finished");
                inner.stop();
            }
        }
    }

    pub(crate) fn stop(&self) {
        if let Some(inner) = self.0.upgrade() {
            lock(&inner).stop();
        }
    }
}

/// A receive stream: readers feed it packets, it reassembles them into heaps and hands those
///  to its [HeapSink].
///
/// The stream stops when [Stream::stop] is called, when a heap marks the end of the stream,
///  when all its readers finished, or when it is dropped. Stopping is idempotent and can
///  happen from any thread.
pub struct Stream {
    inner: Arc<Mutex<StreamInner>>,
    runtime: Handle,
}

impl Stream {
    pub fn new(runtime: Handle, config: ReceiveStreamConfig, sink: impl HeapSink) -> anyhow::Result<Stream> {
        config.validate()?;
        debug!("creating receive stream with {:?}", config);

        Ok(Stream {
            inner: Arc::new(Mutex::new(StreamInner {
                reassembler: Reassembler::new(&config),
                sink: Box::new(sink),
                readers: Vec::new(),
                active_readers: 0,
                stopped: false,
            })),
            runtime,
        })
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn stream_ref(&self) -> StreamRef {
        StreamRef(Arc::downgrade(&self.inner))
    }

    /// Attaches a reader. `start` is called without the stream's lock held, so it may hand
    ///  packets to the stream right away.
    pub(crate) fn attach_reader(&self, start: impl FnOnce(StreamRef) -> anyhow::Result<Box<dyn ReaderControl>>) -> anyhow::Result<()> {
        {
            let mut inner = lock(&self.inner);
            if inner.stopped {
                bail!("can not add a reader to a stopped stream");
            }
            inner.active_readers += 1;
        }

        match start(self.stream_ref()) {
            Ok(mut control) => {
                let mut inner = lock(&self.inner);
                if inner.stopped {
                    control.stop();
                }
                else {
                    inner.readers.push(control);
                }
                Ok(())
            }
            Err(e) => {
                let mut inner = lock(&self.inner);
                inner.active_readers = inner.active_readers.saturating_sub(1);
                Err(e)
            }
        }
    }

    /// Stops all readers and the stream. Incomplete heaps are discarded. No packets are
    ///  processed after this returns.
    pub fn stop(&self) {
        lock(&self.inner).stop();
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.inner).stopped
    }

    pub fn stats(&self) -> StreamStats {
        *lock(&self.inner).reassembler.stats()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.stop();
    }
}
