use std::sync::Arc;
use async_trait::async_trait;
use spead_protocol::heap::Heap;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

pub mod batching;
pub mod blocking;
pub mod packet_sink;
pub mod rate_limiter;
pub mod send_stream;
pub mod udp;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("too many heaps in flight")]
    QueueFull,
    #[error("stream shut down before the heap was sent")]
    Stopped,
    #[error("heap can not be sent: {0}")]
    InvalidHeap(String),
    #[error("error sending packet: {0}")]
    Io(String),
}

/// Number of bytes put on the wire for a heap, or the reason it was not (completely) sent
pub type SendResult = Result<usize, SendError>;

pub type CompletionCallback = Box<dyn FnOnce(SendResult) + Send + 'static>;

/// Something heaps can be sent through. The send stream implements this, and the wrappers in
///  this module add behaviour on top of any implementation.
#[async_trait]
pub trait HeapSender: Send + Sync + 'static {
    /// Queues a heap for sending. `on_complete` is called exactly once, after all the heap's
    ///  packets were handed to the transport or when sending failed.
    ///
    /// Returns `false` if the heap was not queued. The callback still fires in that case, with
    ///  the reason.
    async fn async_send_heap(&self, heap: Arc<Heap>, on_complete: CompletionCallback) -> bool;

    /// waits until the packets of all heaps queued so far were handed to the transport
    async fn flush(&self);

    /// the runtime the sender does its I/O on
    fn runtime(&self) -> &Handle;

    async fn send_heap(&self, heap: Arc<Heap>) -> SendResult {
        let (tx, rx) = oneshot::channel();
        self.async_send_heap(heap, Box::new(move |result| {
            let _ = tx.send(result);
        })).await;
        rx.await.unwrap_or(Err(SendError::Stopped))
    }
}

/// Fires a heap's completion callback exactly once: explicitly with a result, or with
///  [SendError::Stopped] if it is dropped before that.
pub(crate) struct Completion {
    callback: Option<CompletionCallback>,
}

impl Completion {
    pub(crate) fn new(callback: CompletionCallback) -> Completion {
        Completion { callback: Some(callback) }
    }

    pub(crate) fn complete(mut self, result: SendResult) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(SendError::Stopped));
        }
    }
}
