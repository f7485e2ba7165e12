//! Wire-level building blocks for SPEAD heaps: the item pointer encoding, packet header
//!  decoding, the send-side heap representation and the generator that slices a heap into
//!  packets.
//!
//! A *heap* is the unit of transfer. It consists of items (each with a numeric id and a
//!  value), descriptors (opaque metadata for items) and an optional end-of-stream marker.
//!  A heap is split into one or more packets, each of which carries a slice of the heap's
//!  payload and some or all of the heap's item pointers.
//!
//! ## Packet header
//!
//! ```ascii
//! 0: magic (0x53)
//! 1: version (4)
//! 2: item pointer width minus heap address width, in bytes
//! 3: heap address width in bytes
//! 4: reserved (2 bytes, zero)
//! 6: number of item pointers (u16)
//! 8: item pointers (u64 each)
//! *: payload
//! ```
//!
//! All numbers are big endian.
//!
//! ## Item pointers
//!
//! An item pointer is 64 bits wide. Its layout depends on the *heap address width* `hab`,
//!  which is configured per stream (40 bits by default):
//!
//! ```ascii
//! bit 63:          immediate flag
//! bits hab..63:    item id
//! bits 0..hab:     immediate value, or the item's offset in the heap payload
//! ```
//!
//! Immediate items store their value inline in the low `hab` bits, left-aligned. Addressed
//!  items store the offset of their first byte in the heap payload; their length is implied
//!  by the next item's offset (or the end of the heap).
//!
//! Every packet starts with four immediate pointers: heap counter, heap size, heap offset and
//!  payload length. These are followed by the heap's own pointers (descriptors, items and
//!  the end marker), as many as fit into the packet. Packets that have no room left for
//!  pointers carry only payload. When a heap takes more than one packet, every packet with
//!  pointers carries payload as well, if necessary zero padding that starts at an addressed
//!  pointer with id 0.

pub mod constants;
pub mod heap;
pub mod item_pointer;
pub mod packet_generator;
pub mod packet_header;
pub mod safe_converter;
