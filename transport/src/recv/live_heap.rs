use std::cmp::max;
use std::collections::BTreeMap;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use spead_protocol::constants::{is_packet_bookkeeping_id, BugCompat, CTRL_STREAM_STOP, DESCRIPTOR_ID, NULL_ID, STREAM_CTRL_ID};
use spead_protocol::item_pointer::ItemPointerLayout;
use spead_protocol::packet_header::PacketHeader;
use spead_protocol::safe_converter::{PrecheckedCast, SafeCast};
use tracing::warn;
use crate::recv::completed_heap::{CompletedHeap, ReceivedItem};

/// Disjoint, non-adjacent byte ranges that were received for a heap, keyed by start offset
#[derive(Debug, Default)]
pub(crate) struct RangeSet {
    ranges: BTreeMap<u64, u64>,
    covered: u64,
}

impl RangeSet {
    /// Adds `[start, end)` and returns the number of bytes that were not covered before
    pub(crate) fn insert(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }

        let mut merged_start = start;
        let mut merged_end = end;
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                merged_start = s;
                merged_end = max(merged_end, e);
            }
        }

        let overlapping = self.ranges.range(merged_start..=merged_end)
            .map(|(&s, &e)| (s, e))
            .collect::<Vec<_>>();
        let mut previously_covered = 0;
        for (s, e) in overlapping {
            self.ranges.remove(&s);
            previously_covered += e - s;
            merged_end = max(merged_end, e);
        }
        self.ranges.insert(merged_start, merged_end);

        let added = (merged_end - merged_start) - previously_covered;
        self.covered += added;
        added
    }

    pub(crate) fn contains(&self, start: u64, end: u64) -> bool {
        self.ranges.range(..=start).next_back()
            .map_or(false, |(_, &e)| e >= end)
    }

    pub(crate) fn covered(&self) -> u64 {
        self.covered
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PacketDisposition {
    Accepted,
    /// nothing new in the packet
    Duplicate,
    /// the packet contradicts what was received for the heap so far
    Inconsistent(String),
}

/// An item pointer together with its place in the sender's order: a heap's packets carry
///  increasing payload offsets, and pointers keep their order within a packet
#[derive(Debug, Clone, Copy)]
struct ReceivedPointer {
    payload_offset: u64,
    index: usize,
    pointer: u64,
}

/// Reassembly state of one partially received heap
pub(crate) struct LiveHeap {
    cnt: u64,
    layout: ItemPointerLayout,
    heap_length: Option<u64>,
    received: RangeSet,
    /// the heap's own item pointers in order of arrival, without the per-packet bookkeeping
    pointers: Vec<ReceivedPointer>,
    seen_pointers: FxHashSet<u64>,
    payload: Vec<u8>,
    num_packets: usize,
    end_of_stream: bool,
    pub(crate) last_touched: u64,
}

impl LiveHeap {
    pub(crate) fn new(packet: &PacketHeader) -> LiveHeap {
        LiveHeap {
            cnt: packet.heap_cnt,
            layout: packet.layout,
            heap_length: None,
            received: RangeSet::default(),
            pointers: Vec::new(),
            seen_pointers: FxHashSet::default(),
            payload: Vec::new(),
            num_packets: 0,
            end_of_stream: false,
            last_touched: 0,
        }
    }

    pub(crate) fn cnt(&self) -> u64 {
        self.cnt
    }

    pub(crate) fn add_packet(&mut self, packet: &PacketHeader, max_heap_size: usize, tick: u64) -> PacketDisposition {
        if packet.layout != self.layout {
            return PacketDisposition::Inconsistent(format!("heap address width changed to {}", packet.layout.heap_address_bits()));
        }

        let start = packet.payload_offset;
        let end = match start.checked_add(packet.payload_length.safe_cast()) {
            Some(end) => end,
            None => return PacketDisposition::Inconsistent("payload offset overflow".to_string()),
        };
        if end > max_heap_size.safe_cast() {
            return PacketDisposition::Inconsistent(format!("payload end {} exceeds maximum heap size", end));
        }

        match (self.heap_length, packet.heap_length) {
            (Some(known), Some(declared)) if known != declared => {
                return PacketDisposition::Inconsistent(format!("heap length changed from {} to {}", known, declared));
            }
            (Some(known), None) if end > known => {
                return PacketDisposition::Inconsistent(format!("payload end {} beyond heap length {}", end, known));
            }
            (None, Some(declared)) => {
                if declared > max_heap_size.safe_cast() {
                    return PacketDisposition::Inconsistent(format!("heap length {} exceeds maximum heap size", declared));
                }
                if self.payload.len().safe_cast() > declared {
                    return PacketDisposition::Inconsistent(format!("heap length {} is less than data received so far", declared));
                }
                self.heap_length = Some(declared);
                self.payload.resize(declared.prechecked_cast(), 0);
            }
            _ => {}
        }

        if self.is_duplicate(packet, start, end) {
            return PacketDisposition::Duplicate;
        }

        if start < end {
            let end_index: usize = end.prechecked_cast();
            if self.payload.len() < end_index {
                self.payload.resize(end_index, 0);
            }
            self.payload[start.prechecked_cast()..end_index].copy_from_slice(packet.payload);
            self.received.insert(start, end);
        }

        for (index, pointer) in packet.pointers().enumerate() {
            let id = self.layout.id(pointer);
            // an addressed null pointer marks where the sender's padding starts
            let is_padding = id == NULL_ID && !self.layout.is_immediate(pointer);
            if (is_packet_bookkeeping_id(id) && !is_padding) || !self.seen_pointers.insert(pointer) {
                continue;
            }
            if id == STREAM_CTRL_ID && self.layout.is_immediate(pointer) && self.layout.value(pointer) == CTRL_STREAM_STOP {
                self.end_of_stream = true;
            }
            self.pointers.push(ReceivedPointer { payload_offset: start, index, pointer });
        }

        self.num_packets += 1;
        self.last_touched = tick;
        PacketDisposition::Accepted
    }

    fn is_duplicate(&self, packet: &PacketHeader, start: u64, end: u64) -> bool {
        if start < end {
            return self.received.contains(start, end);
        }
        // a packet without payload only carries pointers
        self.num_packets > 0 && packet.pointers()
            .filter(|&p| !is_packet_bookkeeping_id(self.layout.id(p)))
            .all(|p| self.seen_pointers.contains(&p))
    }

    pub(crate) fn is_complete(&self) -> bool {
        match self.heap_length {
            Some(heap_length) => self.received.covered() == heap_length,
            None => self.end_of_stream,
        }
    }

    /// Resolves descriptors and items, in the order the sender added them. Addressed items
    ///  extend to the next item's offset, or to the end of the heap for the last one. Of several
    ///  items at the same offset, all but the last are empty.
    pub(crate) fn into_completed(self, bug_compat: BugCompat) -> CompletedHeap {
        let layout = self.layout;
        let payload = Bytes::from(self.payload);
        let heap_length: u64 = payload.len().safe_cast();

        let mut pointers = self.pointers;
        pointers.sort_by_key(|p| (p.payload_offset, p.index));

        // stable sort, so equal offsets stay in the sender's order
        let mut addressed = pointers.iter()
            .enumerate()
            .filter(|(_, p)| !layout.is_immediate(p.pointer))
            .map(|(position, p)| (layout.value(p.pointer), position))
            .collect::<Vec<_>>();
        addressed.sort_by_key(|&(offset, _)| offset);
        let mut ends = vec![heap_length; pointers.len()];
        for pair in addressed.windows(2) {
            ends[pair[0].1] = pair[1].0;
        }

        let mut descriptors = Vec::new();
        let mut items = Vec::new();
        for (position, received) in pointers.iter().enumerate() {
            let pointer = received.pointer;
            let id = layout.id(pointer);
            let is_immediate = layout.is_immediate(pointer);

            if id == NULL_ID || (id == STREAM_CTRL_ID && is_immediate) {
                continue;
            }

            let data = if is_immediate {
                Bytes::from(layout.immediate_bytes(pointer))
            }
            else {
                let start = layout.value(pointer);
                if start > heap_length {
                    warn!("heap {}: item {:#x} starts at {}, beyond the heap's end {}", self.cnt, id, start, heap_length);
                    continue;
                }
                let end = ends[position].min(heap_length);
                payload.slice(start.prechecked_cast()..end.prechecked_cast())
            };

            if id == DESCRIPTOR_ID {
                descriptors.push(data);
            }
            else {
                items.push(ReceivedItem { id, data, is_immediate });
            }
        }

        CompletedHeap {
            cnt: self.cnt,
            bug_compat,
            descriptors,
            items,
            end_of_stream: self.end_of_stream,
        }
    }
}
