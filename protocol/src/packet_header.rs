use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use bytes::Buf;
use crate::constants::*;
use crate::item_pointer::ItemPointerLayout;
use crate::safe_converter::SafeCast;

/// A decoded packet, borrowing pointer table and payload from the receive buffer.
#[derive(Clone, Copy)]
pub struct PacketHeader<'a> {
    pub layout: ItemPointerLayout,
    pub heap_cnt: u64,
    /// total length of the heap's payload, if the sender declared it
    pub heap_length: Option<u64>,
    pub payload_offset: u64,
    pub payload_length: usize,
    pointers: &'a [u8],
    pub payload: &'a [u8],
}

impl Debug for PacketHeader<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{#{}@{}+{}/{:?}:{}ptrs}}", self.heap_cnt, self.payload_offset, self.payload_length, self.heap_length, self.n_pointers())
    }
}

impl<'a> PacketHeader<'a> {
    /// Decodes the packet at the start of `buf`, returning it together with the number of
    ///  bytes it occupies. Trailing bytes after the payload are not part of the packet.
    pub fn decode(buf: &'a [u8]) -> anyhow::Result<(PacketHeader<'a>, usize)> {
        let mut header = buf;
        if header.try_get_u8()? != MAGIC {
            bail!("not a SPEAD packet: wrong magic number");
        }
        let version = header.try_get_u8()?;
        if version != VERSION {
            bail!("unsupported protocol version {}", version);
        }
        let item_pointer_bytes = header.try_get_u8()?;
        let address_bytes = header.try_get_u8()?;
        if usize::from(item_pointer_bytes) + usize::from(address_bytes) != ITEM_POINTER_SIZE {
            bail!("unsupported item pointer width {}+{}", item_pointer_bytes, address_bytes);
        }
        let layout = ItemPointerLayout::new(u32::from(address_bytes) * 8)?;
        header.try_get_u16()?; // reserved
        let n_items: usize = header.try_get_u16()?.safe_cast();

        let pointers_end = HEADER_SIZE + n_items * ITEM_POINTER_SIZE;
        if buf.len() < pointers_end {
            bail!("packet truncated: {} item pointers do not fit into {} bytes", n_items, buf.len());
        }
        let pointers = &buf[HEADER_SIZE..pointers_end];

        let mut heap_cnt = None;
        let mut heap_length = None;
        let mut payload_offset = None;
        let mut payload_length = None;
        for pointer in pointers.chunks_exact(ITEM_POINTER_SIZE) {
            let pointer = u64::from_be_bytes(pointer.try_into()?);
            if !layout.is_immediate(pointer) {
                continue;
            }
            let value = layout.value(pointer);
            match layout.id(pointer) {
                HEAP_CNT_ID => heap_cnt = Some(value),
                HEAP_LENGTH_ID => heap_length = Some(value),
                PAYLOAD_OFFSET_ID => payload_offset = Some(value),
                PAYLOAD_LENGTH_ID => payload_length = Some(value),
                _ => {}
            }
        }

        let heap_cnt = heap_cnt.ok_or_else(|| anyhow!("packet without heap counter"))?;
        let payload_offset = payload_offset.ok_or_else(|| anyhow!("packet without payload offset"))?;
        let payload_length = payload_length.ok_or_else(|| anyhow!("packet without payload length"))?;

        let payload_length: usize = payload_length.try_into()?;
        let packet_len = pointers_end.checked_add(payload_length)
            .ok_or_else(|| anyhow!("payload length overflow"))?;
        if buf.len() < packet_len {
            bail!("packet truncated: payload of {} bytes does not fit into {} bytes", payload_length, buf.len());
        }
        if let Some(heap_length) = heap_length {
            if payload_offset.checked_add(payload_length.safe_cast()).map_or(true, |end| end > heap_length) {
                bail!("payload {}+{} exceeds heap length {}", payload_offset, payload_length, heap_length);
            }
        }

        Ok((PacketHeader {
            layout,
            heap_cnt,
            heap_length,
            payload_offset,
            payload_length,
            pointers,
            payload: &buf[pointers_end..packet_len],
        }, packet_len))
    }

    pub fn n_pointers(&self) -> usize {
        self.pointers.len() / ITEM_POINTER_SIZE
    }

    /// All item pointers of the packet, including the mandatory bookkeeping pointers
    pub fn pointers(&self) -> impl Iterator<Item = u64> + 'a {
        self.pointers.chunks_exact(ITEM_POINTER_SIZE)
            .map(|raw| {
                let mut raw = raw;
                raw.get_u64()
            })
    }
}
