//! Sending and receiving SPEAD heaps over the network.
//!
//! ## Sending
//!
//! A [send::send_stream::SendStream] accepts heaps, turns each of them into packets and hands
//!  the packets to a [send::packet_sink::PacketSink] (a UDP socket, or memory for serializing
//!  heaps to a buffer). Heaps are sent one after the other in the order they were submitted,
//!  paced by a token bucket:
//!
//! ```ascii
//! producer -> async_send_heap -> [queue, at most max_heaps] -> send loop -> rate limiter -> sink
//!                                                                  |
//!                                             completion callback <+
//! ```
//!
//! Every heap's completion callback fires exactly once: with the number of bytes sent, with a
//!  transport error, or with an error if the heap was rejected or the stream went away. The
//!  callback runs on the send loop's task. The wrappers in [send::blocking] and
//!  [send::batching] move results to caller threads through a [signal_queue::SignalQueue].
//!
//! ## Receiving
//!
//! A [recv::stream::Stream] owns the reassembly state. Readers (memory, UDP, InfiniBand verbs)
//!  feed raw packets into it; all packet handling for a stream happens under the stream's
//!  lock, so the reassembly code itself is single-threaded. Completed heaps go to a
//!  [recv::stream::HeapSink], typically the queue of a [recv::ring_stream::RingStream].
//!
//! ```ascii
//! UDP reader ---+
//! verbs reader -+--> Stream (locked) --> Reassembler --> HeapSink
//! mem reader ---+
//! ```
//!
//! Partially received heaps are tracked per heap counter. When more heaps are in flight than
//!  configured, the least recently touched one is discarded. Packets that can not be decoded
//!  are counted and dropped; they never stop the stream.

pub mod config;
pub mod recv;
pub mod send;
pub mod signal_queue;
pub mod thread_pool;
