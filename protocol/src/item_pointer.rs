use anyhow::bail;
use crate::constants::{DEFAULT_HEAP_ADDRESS_BITS, ITEM_POINTER_SIZE};
use crate::safe_converter::SafeCast;

const IMMEDIATE_FLAG: u64 = 1 << 63;

/// Encodes and decodes item pointers for a given heap address width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemPointerLayout {
    heap_address_bits: u32,
}

impl Default for ItemPointerLayout {
    fn default() -> Self {
        ItemPointerLayout { heap_address_bits: DEFAULT_HEAP_ADDRESS_BITS }
    }
}

impl ItemPointerLayout {
    pub fn new(heap_address_bits: u32) -> anyhow::Result<ItemPointerLayout> {
        if heap_address_bits == 0 || heap_address_bits >= 64 || heap_address_bits % 8 != 0 {
            bail!("heap address bits must be a multiple of 8 between 8 and 56, was {}", heap_address_bits);
        }
        Ok(ItemPointerLayout { heap_address_bits })
    }

    pub fn heap_address_bits(&self) -> u32 {
        self.heap_address_bits
    }

    /// number of bytes available for an immediate value
    pub fn address_bytes(&self) -> usize {
        (self.heap_address_bits / 8).safe_cast()
    }

    pub fn max_address(&self) -> u64 {
        (1u64 << self.heap_address_bits) - 1
    }

    pub fn max_id(&self) -> u64 {
        (1u64 << (63 - self.heap_address_bits)) - 1
    }

    pub fn make_immediate(&self, id: u64, value: u64) -> u64 {
        debug_assert!(id <= self.max_id());
        IMMEDIATE_FLAG | (id << self.heap_address_bits) | (value & self.max_address())
    }

    pub fn make_address(&self, id: u64, offset: u64) -> u64 {
        debug_assert!(id <= self.max_id());
        debug_assert!(offset <= self.max_address());
        (id << self.heap_address_bits) | offset
    }

    /// Stores `data` left-aligned in the value bits. The caller is responsible for checking
    ///  that it fits, see [ItemPointerLayout::fits_immediate].
    pub fn make_immediate_bytes(&self, id: u64, data: &[u8]) -> u64 {
        debug_assert!(self.fits_immediate(data.len()));

        let mut raw = self.make_immediate(id, 0).to_be_bytes();
        let start = ITEM_POINTER_SIZE - self.address_bytes();
        raw[start..start + data.len()].copy_from_slice(data);
        u64::from_be_bytes(raw)
    }

    pub fn fits_immediate(&self, len: usize) -> bool {
        len <= self.address_bytes()
    }

    pub fn is_immediate(&self, pointer: u64) -> bool {
        pointer & IMMEDIATE_FLAG != 0
    }

    pub fn id(&self, pointer: u64) -> u64 {
        (pointer & !IMMEDIATE_FLAG) >> self.heap_address_bits
    }

    /// immediate value or payload offset, depending on the immediate flag
    pub fn value(&self, pointer: u64) -> u64 {
        pointer & self.max_address()
    }

    /// The value bits of an immediate pointer as raw bytes, in wire order
    pub fn immediate_bytes(&self, pointer: u64) -> Vec<u8> {
        pointer.to_be_bytes()[ITEM_POINTER_SIZE - self.address_bytes()..].to_vec()
    }
}
