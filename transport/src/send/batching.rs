use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;
use async_trait::async_trait;
use spead_protocol::heap::Heap;
use tokio::runtime::Handle;
use tracing::{error, trace};
use crate::send::{CompletionCallback, HeapSender, SendResult};
use crate::signal_queue::SignalQueue;

struct FinishedHeap {
    callback: CompletionCallback,
    result: SendResult,
}

/// Defers completion callbacks to a thread of the caller's choosing.
///
/// Instead of running callbacks on the runtime's threads, completed heaps are queued. The
///  queue's file descriptor becomes readable while results are pending, so it can be
///  registered with a foreign event loop that then calls [BatchingSendStream::process_callbacks].
pub struct BatchingSendStream<S: HeapSender> {
    inner: S,
    finished: Arc<SignalQueue<FinishedHeap>>,
}

impl<S: HeapSender> BatchingSendStream<S> {
    pub fn new(inner: S) -> anyhow::Result<BatchingSendStream<S>> {
        Ok(BatchingSendStream {
            inner,
            finished: Arc::new(SignalQueue::new()?),
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Runs the callbacks of all heaps completed so far on the calling thread, returning how
    ///  many there were
    pub fn process_callbacks(&self) -> usize {
        let finished = match self.finished.drain() {
            Ok(finished) => finished,
            Err(e) => {
                error!("error collecting completed heaps: {}", e);
                return 0;
            }
        };

        trace!("running {} completion callbacks", finished.len());
        let num_finished = finished.len();
        for FinishedHeap { callback, result } in finished {
            callback(result);
        }
        num_finished
    }
}

impl<S: HeapSender> AsRawFd for BatchingSendStream<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.finished.as_raw_fd()
    }
}

impl<S: HeapSender> AsFd for BatchingSendStream<S> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.finished.as_fd()
    }
}

#[async_trait]
impl<S: HeapSender> HeapSender for BatchingSendStream<S> {
    async fn async_send_heap(&self, heap: Arc<Heap>, on_complete: CompletionCallback) -> bool {
        let finished = self.finished.clone();
        self.inner.async_send_heap(heap, Box::new(move |result| {
            finished.push(FinishedHeap { callback: on_complete, result });
        })).await
    }

    async fn flush(&self) {
        self.inner.flush().await;
    }

    fn runtime(&self) -> &Handle {
        self.inner.runtime()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};
    use tokio::io::unix::AsyncFd;
    use tokio::runtime::Builder;
    use crate::config::SendStreamConfig;
    use crate::send::packet_sink::MemorySink;
    use crate::send::send_stream::SendStream;
    use crate::send::SendError;

    #[test]
    fn test_callbacks_run_on_processing_thread() {
        let rt = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build().unwrap();
        let stream = BatchingSendStream::new(
            SendStream::new(rt.handle().clone(), SendStreamConfig::default(), Arc::new(MemorySink::new())).unwrap()
        ).unwrap();

        let calls = Arc::new(Mutex::new(Vec::<(u64, ThreadId, SendResult)>::new()));
        for cnt in 1..=3 {
            let calls = calls.clone();
            let queued = rt.block_on(stream.async_send_heap(Arc::new(Heap::new(cnt)), Box::new(move |r| {
                calls.lock().unwrap().push((cnt, thread::current().id(), r));
            })));
            assert!(queued);
        }
        rt.block_on(stream.flush());

        // nothing runs before the owner asks for it
        assert!(calls.lock().unwrap().is_empty());

        // callbacks are queued right after the heap's slot is released, so flush may return first
        let mut processed = 0;
        while processed < 3 {
            processed += stream.process_callbacks();
            thread::yield_now();
        }
        assert_eq!(processed, 3);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().map(|c| c.0).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(calls.iter().all(|c| c.1 == thread::current().id()));
        assert!(calls.iter().all(|c| c.2.is_ok()));

        assert_eq!(stream.process_callbacks(), 0);
    }

    #[test]
    fn test_fd_signals_completion() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .build().unwrap();
        rt.block_on(async {
            let config = SendStreamConfig { max_heaps: 1, ..Default::default() };
            let stream = BatchingSendStream::new(
                SendStream::new(Handle::current(), config, Arc::new(MemorySink::new())).unwrap()
            ).unwrap();
            let results = Arc::new(Mutex::new(Vec::new()));

            for cnt in 1..=2 {
                let results = results.clone();
                stream.async_send_heap(Arc::new(Heap::new(cnt)), Box::new(move |r| results.lock().unwrap().push(r))).await;
            }

            let fd = AsyncFd::new(stream.as_fd()).unwrap();
            let mut processed = 0;
            while processed < 2 {
                let mut guard = fd.readable().await.unwrap();
                processed += stream.process_callbacks();
                guard.clear_ready();
            }

            let results = results.lock().unwrap();
            assert!(results.contains(&Ok(40)));
            assert!(results.contains(&Err(SendError::QueueFull)));
        });
    }
}
