use std::sync::Arc;
use async_trait::async_trait;
use spead_protocol::heap::Heap;
use spead_protocol::packet_generator::PacketGenerator;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, error, trace, warn};
use crate::config::{QueueFullPolicy, SendStreamConfig};
use crate::send::packet_sink::PacketSink;
use crate::send::rate_limiter::RateLimiter;
use crate::send::{Completion, CompletionCallback, HeapSender, SendError, SendResult};

struct QueuedHeap {
    generator: PacketGenerator,
    completion: Completion,
    permit: OwnedSemaphorePermit,
}

/// Sends heaps through a [PacketSink], one heap at a time in submission order.
///
/// The packets are generated and sent by a task on the stream's runtime. That task owns the
///  rate limiter; the only state shared with submitters is the queue and the semaphore
///  bounding the number of heaps in flight. Dropping the stream lets the task finish the heaps
///  that are already queued.
pub struct SendStream {
    config: Arc<SendStreamConfig>,
    runtime: Handle,
    queue: mpsc::UnboundedSender<QueuedHeap>,
    slots: Arc<Semaphore>,
}

impl SendStream {
    pub fn new(runtime: Handle, config: SendStreamConfig, sink: Arc<dyn PacketSink>) -> anyhow::Result<SendStream> {
        config.validate()?;
        let config = Arc::new(config);

        let (queue, queue_receiver) = mpsc::unbounded_channel();
        let rate_limiter = RateLimiter::new(config.rate, config.burst_size);
        runtime.spawn(Self::send_loop(sink, queue_receiver, rate_limiter));

        Ok(SendStream {
            runtime,
            queue,
            slots: Arc::new(Semaphore::new(config.max_heaps)),
            config,
        })
    }

    pub fn config(&self) -> &SendStreamConfig {
        &self.config
    }

    async fn send_loop(sink: Arc<dyn PacketSink>, mut queue: mpsc::UnboundedReceiver<QueuedHeap>, mut rate_limiter: RateLimiter) {
        while let Some(QueuedHeap { mut generator, completion, permit }) = queue.recv().await {
            let heap_cnt = generator.heap_cnt();
            let mut result: SendResult = Ok(0);

            while let Some(packet) = generator.next_packet() {
                rate_limiter.acquire(packet.len()).await;
                if let Err(e) = sink.send_packet(&packet).await {
                    error!("error sending packet of heap {}: {}", heap_cnt, e);
                    result = Err(SendError::Io(e.to_string()));
                    break;
                }
                if let Ok(sent) = &mut result {
                    *sent += packet.len();
                }
            }

            trace!("heap {} completed: {:?}", heap_cnt, result);

            // free the slot first so that the callback can submit the next heap
            drop(permit);
            completion.complete(result);
        }
        debug!("send stream closed");
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, SendError> {
        match self.config.queue_full_policy {
            QueueFullPolicy::Reject => match self.slots.clone().try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => Err(SendError::QueueFull),
                Err(TryAcquireError::Closed) => Err(SendError::Stopped),
            },
            QueueFullPolicy::Block => self.slots.clone().acquire_owned().await
                .map_err(|_| SendError::Stopped),
        }
    }

    /// Calls the callback from a separate task rather than inline, so that it never runs
    ///  while the submitter is still inside [HeapSender::async_send_heap]
    fn fail_later(&self, completion: Completion, error: SendError) {
        self.runtime.spawn(async move {
            completion.complete(Err(error));
        });
    }
}

#[async_trait]
impl HeapSender for SendStream {
    async fn async_send_heap(&self, heap: Arc<Heap>, on_complete: CompletionCallback) -> bool {
        let completion = Completion::new(on_complete);

        let generator = match PacketGenerator::new(&heap, self.config.max_packet_size) {
            Ok(generator) => generator,
            Err(e) => {
                warn!("rejecting heap {}: {}", heap.cnt(), e);
                self.fail_later(completion, SendError::InvalidHeap(e.to_string()));
                return false;
            }
        };

        let permit = match self.acquire_slot().await {
            Ok(permit) => permit,
            Err(e) => {
                debug!("heap {} not queued: {}", heap.cnt(), e);
                self.fail_later(completion, e);
                return false;
            }
        };

        trace!("queueing heap {}", heap.cnt());
        // if the send loop is gone, the returned heap's completion reports that on drop
        self.queue.send(QueuedHeap { generator, completion, permit }).is_ok()
    }

    async fn flush(&self) {
        let max_heaps = u32::try_from(self.config.max_heaps).unwrap_or(u32::MAX);
        // every heap in flight holds a permit until it is completed
        let _all = self.slots.acquire_many(max_heaps).await;
    }

    fn runtime(&self) -> &Handle {
        &self.runtime
    }
}
