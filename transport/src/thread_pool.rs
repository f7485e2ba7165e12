use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// A set of worker threads that streams run their I/O on.
///
/// Streams only need a [Handle]; this is a convenience for callers that do not have a tokio
///  runtime of their own. Dropping the pool shuts the workers down, so it must outlive the
///  streams using it, and it must not be dropped from inside one of its own tasks.
pub struct ThreadPool {
    runtime: Runtime,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> anyhow::Result<ThreadPool> {
        let num_threads = num_threads.max(1);
        debug!("starting thread pool with {} threads", num_threads);

        let runtime = Builder::new_multi_thread()
            .worker_threads(num_threads)
            .thread_name("spead-worker")
            .enable_all()
            .build()?;
        Ok(ThreadPool { runtime })
    }

    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }
}
