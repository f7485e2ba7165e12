use thiserror::Error;

pub mod completed_heap;
pub mod frame;
pub mod ibv;
mod live_heap;
pub mod mem_reader;
pub mod reassembly;
pub mod ring_stream;
pub mod stream;
pub mod udp_reader;

/// Returned by consumers of a stream once it stopped and all its heaps were taken
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("stream stopped")]
pub struct Stopped;
