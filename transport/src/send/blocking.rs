use std::sync::{Arc, Mutex, PoisonError};
use spead_protocol::heap::Heap;
use tracing::error;
use crate::send::{HeapSender, SendError, SendResult};
use crate::signal_queue::SignalQueue;

/// Adds a synchronous `send_heap` to any heap sender, for callers that are not running on an
///  async runtime.
///
/// The calling thread blocks on a semaphore until the heap's completion callback has fired.
///  Waits interrupted by a signal are resumed, and the heap is kept alive until the callback
///  fired in any case.
pub struct BlockingSendStream<S: HeapSender> {
    inner: S,
    results: Arc<SignalQueue<SendResult>>,
    /// one blocking send at a time, so each caller pops its own result
    send_lock: Mutex<()>,
}

impl<S: HeapSender> BlockingSendStream<S> {
    pub fn new(inner: S) -> anyhow::Result<BlockingSendStream<S>> {
        Ok(BlockingSendStream {
            inner,
            results: Arc::new(SignalQueue::new()?),
            send_lock: Mutex::new(()),
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Sends a heap and waits for it to be handed to the transport.
    ///
    /// This must not be called from a thread of the runtime the stream uses.
    pub fn send_heap(&self, heap: Arc<Heap>) -> SendResult {
        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let results = self.results.clone();
        self.inner.runtime().block_on(self.inner.async_send_heap(heap.clone(), Box::new(move |result| {
            results.push(result);
        })));

        let result = self.results.pop()
            .map_err(|e| {
                error!("error waiting for heap completion: {}", e);
                SendError::Io(e.to_string())
            })
            .and_then(|r| r);

        drop(heap);
        result
    }

    /// Waits for all heaps sent so far, including those sent through the inner stream directly
    pub fn flush(&self) {
        self.inner.runtime().block_on(self.inner.flush());
    }
}
