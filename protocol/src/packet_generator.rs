use std::cmp::min;
use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};
use crate::constants::*;
use crate::heap::Heap;
use crate::item_pointer::ItemPointerLayout;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// A packet ready for transmission, as a gather list: the first buffer holds header and item
///  pointers, the others are slices of item values.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    buffers: Vec<Bytes>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet{{{} bytes in {} buffers}}", self.len(), self.buffers.len())
    }
}

impl Packet {
    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the packet into a single contiguous buffer
    pub fn to_bytes(&self) -> Bytes {
        if self.buffers.len() == 1 {
            return self.buffers[0].clone();
        }
        let mut result = BytesMut::with_capacity(self.len());
        for buf in &self.buffers {
            result.put_slice(buf);
        }
        result.freeze()
    }
}

/// Turns a heap into a finite sequence of packets.
///
/// The item pointer table (descriptors, then items, then the end marker) goes into the first
///  packet(s), as much as fits; the remaining room of each packet is filled with payload.
///
/// Every packet that carries pointers also carries at least one payload byte, so a receiver
///  that has the whole payload has all pointers as well. A heap with less payload than it
///  needs pointer packets is padded with zeros, and an addressed pointer with the null id marks
///  the start of the padding. A heap whose pointers fit into a single packet is sent as one
///  packet, with or without payload.
///
/// The generator holds shared references to the item values, so it does not borrow the heap.
///  It can not be rewound: create a new generator to send a heap again.
pub struct PacketGenerator {
    layout: ItemPointerLayout,
    cnt: u64,
    max_packet_size: usize,
    max_pointers_per_packet: usize,

    pointers: Vec<u64>,
    payload: Vec<Bytes>,
    payload_size: u64,

    next_pointer: usize,
    payload_offset: u64,
    chunk_index: usize,
    chunk_offset: usize,
    first: bool,
}

impl PacketGenerator {
    /// Creates a generator and freezes the heap. `max_packet_size` is rounded down to a
    ///  multiple of the item pointer size.
    pub fn new(heap: &Heap, max_packet_size: usize) -> anyhow::Result<PacketGenerator> {
        let layout = heap.layout();
        let max_packet_size = max_packet_size - max_packet_size % ITEM_POINTER_SIZE;
        if max_packet_size < MIN_PACKET_SIZE {
            bail!("packet size must be at least {} bytes, was {}", MIN_PACKET_SIZE, max_packet_size);
        }
        if heap.cnt() > layout.max_address() {
            bail!("heap counter {} does not fit into {} bits", heap.cnt(), layout.heap_address_bits());
        }

        let mut pointers = Vec::with_capacity(heap.descriptors().len() + heap.items().len() + 2);
        let mut payload = Vec::new();
        let mut payload_size = 0u64;

        for descriptor in heap.descriptors() {
            pointers.push(layout.make_address(DESCRIPTOR_ID, min(payload_size, layout.max_address())));
            payload_size += descriptor.len().safe_cast();
            payload.push(descriptor.clone());
        }
        for item in heap.items() {
            if item.allow_immediate && layout.fits_immediate(item.data.len()) {
                pointers.push(layout.make_immediate_bytes(item.id, &item.data));
            }
            else {
                pointers.push(layout.make_address(item.id, min(payload_size, layout.max_address())));
                payload_size += item.data.len().safe_cast();
                payload.push(item.data.clone());
            }
        }
        if heap.is_ended() {
            pointers.push(layout.make_immediate(STREAM_CTRL_ID, CTRL_STREAM_STOP));
        }

        // leaves room for at least one payload byte next to the pointers
        let max_pointers_per_packet = (max_packet_size - HEADER_SIZE - MANDATORY_POINTERS * ITEM_POINTER_SIZE - 1) / ITEM_POINTER_SIZE;
        let num_pointer_packets = pointers.len().div_ceil(max_pointers_per_packet);
        if num_pointer_packets > 1 && payload_size < num_pointer_packets.safe_cast() {
            pointers.push(layout.make_address(NULL_ID, min(payload_size, layout.max_address())));
            let padded_size: u64 = pointers.len().div_ceil(max_pointers_per_packet).safe_cast();
            let padding = padded_size - payload_size;
            trace!("heap {}: padding payload with {} bytes", heap.cnt(), padding);
            payload.push(Bytes::from(vec![0u8; padding.prechecked_cast()]));
            payload_size = padded_size;
        }

        if payload_size > layout.max_address() {
            bail!("heap payload of {} bytes does not fit into {} bit addresses", payload_size, layout.heap_address_bits());
        }

        heap.freeze();
        debug!("heap {}: generating packets for {} pointers and {} payload bytes", heap.cnt(), pointers.len(), payload_size);

        Ok(PacketGenerator {
            layout,
            cnt: heap.cnt(),
            max_packet_size,
            max_pointers_per_packet,
            pointers,
            payload,
            payload_size,
            next_pointer: 0,
            payload_offset: 0,
            chunk_index: 0,
            chunk_offset: 0,
            first: true,
        })
    }

    pub fn heap_cnt(&self) -> u64 {
        self.cnt
    }

    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    pub fn has_next_packet(&self) -> bool {
        self.first
            || self.next_pointer < self.pointers.len()
            || self.payload_offset < self.payload_size
    }

    pub fn next_packet(&mut self) -> Option<Packet> {
        if !self.has_next_packet() {
            return None;
        }

        let n_pointers = min(self.max_pointers_per_packet, self.pointers.len() - self.next_pointer);
        let payload_room = self.max_packet_size - HEADER_SIZE - (MANDATORY_POINTERS + n_pointers) * ITEM_POINTER_SIZE;
        // one byte is held back for each pointer packet that follows this one
        let later_pointer_packets = (self.pointers.len() - self.next_pointer - n_pointers).div_ceil(self.max_pointers_per_packet);
        let available = (self.payload_size - self.payload_offset).saturating_sub(later_pointer_packets.safe_cast());
        let payload_length: usize = min(payload_room.safe_cast(), available).prechecked_cast();

        let n_items = MANDATORY_POINTERS + n_pointers;
        let mut header = BytesMut::with_capacity(HEADER_SIZE + n_items * ITEM_POINTER_SIZE);
        header.put_u8(MAGIC);
        header.put_u8(VERSION);
        header.put_u8((ITEM_POINTER_SIZE - self.layout.address_bytes()).prechecked_cast());
        header.put_u8(self.layout.address_bytes().prechecked_cast());
        header.put_u16(0);
        header.put_u16(n_items.prechecked_cast());
        header.put_u64(self.layout.make_immediate(HEAP_CNT_ID, self.cnt));
        header.put_u64(self.layout.make_immediate(HEAP_LENGTH_ID, self.payload_size));
        header.put_u64(self.layout.make_immediate(PAYLOAD_OFFSET_ID, self.payload_offset));
        header.put_u64(self.layout.make_immediate(PAYLOAD_LENGTH_ID, payload_length.safe_cast()));
        for &pointer in &self.pointers[self.next_pointer..self.next_pointer + n_pointers] {
            header.put_u64(pointer);
        }

        let mut buffers = Vec::with_capacity(2);
        buffers.push(header.freeze());

        let mut remaining = payload_length;
        while remaining > 0 {
            let chunk = &self.payload[self.chunk_index];
            let take = min(remaining, chunk.len() - self.chunk_offset);
            if take > 0 {
                buffers.push(chunk.slice(self.chunk_offset..self.chunk_offset + take));
                self.chunk_offset += take;
                remaining -= take;
            }
            if self.chunk_offset == chunk.len() {
                self.chunk_index += 1;
                self.chunk_offset = 0;
            }
        }

        trace!("heap {}: packet with {} pointers at payload offset {} (+{})", self.cnt, n_pointers, self.payload_offset, payload_length);

        self.first = false;
        self.next_pointer += n_pointers;
        self.payload_offset += payload_length.safe_cast();
        Some(Packet { buffers })
    }
}

impl Iterator for PacketGenerator {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        self.next_packet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::PacketHeader;
    use rstest::*;

    fn decode_all(packets: &[Packet]) -> Vec<(u64, Option<u64>, u64, Vec<u64>, Vec<u8>)> {
        packets.iter()
            .map(|p| {
                let raw = p.to_bytes();
                let (header, len) = PacketHeader::decode(&raw).unwrap();
                assert_eq!(len, raw.len());
                (header.heap_cnt, header.heap_length, header.payload_offset, header.pointers().skip(MANDATORY_POINTERS).collect(), header.payload.to_vec())
            })
            .collect()
    }

    #[test]
    fn test_empty_ended_heap() {
        let mut heap = Heap::new(5);
        heap.add_end().unwrap();

        let packets = PacketGenerator::new(&heap, 1472).unwrap().collect::<Vec<_>>();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), HEADER_SIZE + 5 * ITEM_POINTER_SIZE);

        let layout = ItemPointerLayout::default();
        assert_eq!(decode_all(&packets), vec![
            (5, Some(0), 0, vec![layout.make_immediate(STREAM_CTRL_ID, CTRL_STREAM_STOP)], vec![]),
        ]);
    }

    #[test]
    fn test_empty_item_shares_offset() {
        let mut heap = Heap::new(1);
        heap.add_item(0x100, vec![], false).unwrap();
        heap.add_item(0x101, vec![7; 10], false).unwrap();

        let layout = ItemPointerLayout::default();
        let packets = PacketGenerator::new(&heap, 1472).unwrap().collect::<Vec<_>>();
        assert_eq!(decode_all(&packets), vec![
            (1, Some(10), 0, vec![layout.make_address(0x100, 0), layout.make_address(0x101, 0)], vec![7; 10]),
        ]);
    }

    #[test]
    fn test_empty_heap_without_end() {
        let heap = Heap::new(2);
        let packets = PacketGenerator::new(&heap, 1472).unwrap().collect::<Vec<_>>();
        assert_eq!(decode_all(&packets), vec![(2, Some(0), 0, vec![], vec![])]);
    }

    #[test]
    fn test_header_bytes() {
        let mut heap = Heap::new(1);
        heap.add_item(0x1000, vec![7], true).unwrap();
        let packets = PacketGenerator::new(&heap, 1472).unwrap().collect::<Vec<_>>();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].to_bytes()[..16], &[0x53, 4, 3, 5, 0, 0, 0, 5, 0x80, 0, 1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_immediate_and_addressed_items() {
        let mut heap = Heap::new(1);
        heap.add_descriptor(vec![0xd0, 0xd1]).unwrap();
        heap.add_item(0x1000, vec![1, 2], true).unwrap();
        heap.add_item(0x1001, vec![3, 4, 5, 6, 7, 8], true).unwrap();
        heap.add_item(0x1002, vec![9], false).unwrap();

        let layout = ItemPointerLayout::default();
        let packets = PacketGenerator::new(&heap, 1472).unwrap().collect::<Vec<_>>();
        assert_eq!(decode_all(&packets), vec![
            (1, Some(9), 0, vec![
                layout.make_address(DESCRIPTOR_ID, 0),
                layout.make_immediate_bytes(0x1000, &[1, 2]),
                layout.make_address(0x1001, 2),
                layout.make_address(0x1002, 8),
            ], vec![0xd0, 0xd1, 3, 4, 5, 6, 7, 8, 9]),
        ]);
    }

    #[test]
    fn test_payload_split() {
        let data = (0..100u8).collect::<Vec<_>>();
        let mut heap = Heap::new(9);
        heap.add_item(0x1000, data.clone(), false).unwrap();

        // 64 bytes: 16 payload bytes next to the item pointer, then 24 per packet
        let packets = PacketGenerator::new(&heap, 64).unwrap().collect::<Vec<_>>();
        let decoded = decode_all(&packets);
        assert_eq!(decoded.iter().map(|p| p.2).collect::<Vec<_>>(), vec![0, 16, 40, 64, 88]);
        assert_eq!(decoded.iter().map(|p| p.4.len()).collect::<Vec<_>>(), vec![16, 24, 24, 24, 12]);
        assert!(decoded.iter().all(|p| p.0 == 9 && p.1 == Some(100)));
        assert_eq!(decoded.iter().flat_map(|p| p.4.clone()).collect::<Vec<_>>(), data);
        assert!(packets.iter().all(|p| p.len() <= 64));
    }

    #[test]
    fn test_pointers_spread_over_packets() {
        let mut heap = Heap::new(1);
        for id in 0..5 {
            heap.add_item(0x1000 + id, vec![id as u8], true).unwrap();
        }

        // one pointer per packet, each next to a byte of padding
        let packets = PacketGenerator::new(&heap, 56).unwrap().collect::<Vec<_>>();
        let decoded = decode_all(&packets);
        assert_eq!(decoded.iter().map(|p| p.3.len()).collect::<Vec<_>>(), vec![1; 6]);
        assert_eq!(decoded.iter().map(|p| p.2).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        assert!(decoded.iter().all(|p| p.1 == Some(6) && p.4 == vec![0]));

        let layout = ItemPointerLayout::default();
        assert_eq!(decoded[5].3, vec![layout.make_address(NULL_ID, 0)]);
    }

    #[rstest]
    #[case::single_pointer_packet(3, 5, 1472)]
    #[case::payload_after_pointers(20, 100, 128)]
    #[case::little_payload(30, 2, 128)]
    #[case::no_payload(8, 0, 64)]
    fn test_pointer_packets_carry_payload(#[case] num_immediates: u64, #[case] descriptor_size: usize, #[case] max_packet_size: usize) {
        let mut heap = Heap::new(1);
        if descriptor_size > 0 {
            heap.add_descriptor(vec![0xd; descriptor_size]).unwrap();
        }
        for id in 0..num_immediates {
            heap.add_item(0x1000 + id, vec![id as u8], true).unwrap();
        }

        let packets = PacketGenerator::new(&heap, max_packet_size).unwrap().collect::<Vec<_>>();
        let decoded = decode_all(&packets);
        if decoded.len() > 1 {
            assert!(decoded.iter().all(|p| !p.4.is_empty()));
        }
        assert!(packets.iter().all(|p| p.len() <= max_packet_size));

        let layout = ItemPointerLayout::default();
        let descriptor_payload = decoded.iter().flat_map(|p| p.4.clone()).take(descriptor_size).collect::<Vec<_>>();
        assert_eq!(descriptor_payload, vec![0xd; descriptor_size]);
        let padding = decoded.iter()
            .flat_map(|p| p.3.clone())
            .filter(|&ptr| layout.id(ptr) == NULL_ID)
            .collect::<Vec<_>>();
        assert!(padding.iter().all(|&ptr| layout.value(ptr) == descriptor_size as u64));
    }

    #[test]
    fn test_payload_is_not_copied() {
        let data = Bytes::from(vec![1u8; 3000]);
        let mut heap = Heap::new(1);
        heap.add_item(0x1000, data.clone(), false).unwrap();

        let packets = PacketGenerator::new(&heap, 1472).unwrap().collect::<Vec<_>>();
        assert_eq!(packets[0].buffers()[1].as_ptr(), data.as_ptr());
        let second_offset = packets[0].buffers()[1].len();
        assert_eq!(packets[1].buffers()[1].as_ptr(), data[second_offset..].as_ptr());
    }

    #[rstest]
    #[case::rounded_down(70, 64)]
    #[case::exact(1472, 1472)]
    #[case::minimum(56, 56)]
    fn test_max_packet_size_rounding(#[case] requested: usize, #[case] expected: usize) {
        let mut heap = Heap::new(1);
        heap.add_item(0x1000, vec![0u8; 10_000], false).unwrap();
        let packets = PacketGenerator::new(&heap, requested).unwrap().collect::<Vec<_>>();
        assert_eq!(packets[1].len(), expected);
    }

    #[test]
    fn test_packet_size_too_small() {
        assert!(PacketGenerator::new(&Heap::new(1), 55).is_err());
    }

    #[test]
    fn test_cnt_too_large() {
        let heap = Heap::with_flavour(256, 8, BugCompat::empty()).unwrap();
        assert!(PacketGenerator::new(&heap, 1472).is_err());
    }

    #[test]
    fn test_payload_too_large() {
        let mut heap = Heap::with_flavour(1, 8, BugCompat::empty()).unwrap();
        heap.add_item(0x10, vec![0u8; 256], false).unwrap();
        assert!(PacketGenerator::new(&heap, 1472).is_err());
    }

    #[test]
    fn test_generation_freezes_heap() {
        let mut heap = Heap::new(4);
        let mut generator = PacketGenerator::new(&heap, 1472).unwrap();
        assert!(generator.next().is_some());
        assert!(generator.next().is_none());
        assert!(generator.next().is_none());
        drop(generator);

        assert!(heap.is_frozen());
        assert!(heap.add_item(0x1000, vec![1], true).is_err());
    }
}
