use std::sync::atomic::{AtomicBool, Ordering};
use bytes::Bytes;
use thiserror::Error;
use tracing::trace;
use crate::constants::{is_packet_bookkeeping_id, BugCompat};
use crate::item_pointer::ItemPointerLayout;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("heap {0} can not be modified after packet generation started")]
    Frozen(u64),
    #[error("item id {id:#x} is out of range for {heap_address_bits} bit heap addresses")]
    IdOutOfRange { id: u64, heap_address_bits: u32 },
    #[error("item id {0:#x} is reserved for packet bookkeeping")]
    ReservedId(u64),
}

/// One item of a heap. The value is a shared view of producer memory: cloning an item or
///  slicing its value never copies the underlying bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: u64,
    pub data: Bytes,
    /// Whether the value may be stored inline in the item pointer if it fits. Variable-size
    ///  items must never be sent as immediates, so producers pass `false` for them.
    pub allow_immediate: bool,
}

/// The sending side's representation of a heap.
///
/// A heap is mutable until it is handed to a packet generator, at which point it is frozen.
///  Further modification is rejected with [HeapError::Frozen].
#[derive(Debug)]
pub struct Heap {
    cnt: u64,
    layout: ItemPointerLayout,
    bug_compat: BugCompat,
    items: Vec<Item>,
    descriptors: Vec<Bytes>,
    ended: bool,
    frozen: AtomicBool,
}

impl Heap {
    pub fn new(cnt: u64) -> Heap {
        Heap {
            cnt,
            layout: ItemPointerLayout::default(),
            bug_compat: BugCompat::empty(),
            items: Vec::new(),
            descriptors: Vec::new(),
            ended: false,
            frozen: AtomicBool::new(false),
        }
    }

    pub fn with_flavour(cnt: u64, heap_address_bits: u32, bug_compat: BugCompat) -> anyhow::Result<Heap> {
        let mut result = Heap::new(cnt);
        result.layout = ItemPointerLayout::new(heap_address_bits)?;
        result.bug_compat = bug_compat;
        Ok(result)
    }

    pub fn cnt(&self) -> u64 {
        self.cnt
    }

    pub fn set_cnt(&mut self, cnt: u64) -> Result<(), HeapError> {
        self.check_mutable()?;
        self.cnt = cnt;
        Ok(())
    }

    pub fn layout(&self) -> ItemPointerLayout {
        self.layout
    }

    pub fn bug_compat(&self) -> BugCompat {
        self.bug_compat
    }

    pub fn add_item(&mut self, id: u64, data: impl Into<Bytes>, allow_immediate: bool) -> Result<(), HeapError> {
        self.check_mutable()?;
        if id > self.layout.max_id() {
            return Err(HeapError::IdOutOfRange { id, heap_address_bits: self.layout.heap_address_bits() });
        }
        if is_packet_bookkeeping_id(id) {
            return Err(HeapError::ReservedId(id));
        }

        let data = data.into();
        trace!("heap {}: adding item {:#x} with {} bytes", self.cnt, id, data.len());
        self.items.push(Item { id, data, allow_immediate });
        Ok(())
    }

    /// Adds an encoded descriptor. Descriptors are opaque at this level; they are sent ahead
    ///  of the heap's items.
    pub fn add_descriptor(&mut self, raw: impl Into<Bytes>) -> Result<(), HeapError> {
        self.check_mutable()?;
        self.descriptors.push(raw.into());
        Ok(())
    }

    /// Marks this heap as the last one of its stream
    pub fn add_end(&mut self) -> Result<(), HeapError> {
        self.check_mutable()?;
        self.ended = true;
        Ok(())
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn descriptors(&self) -> &[Bytes] {
        &self.descriptors
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    fn check_mutable(&self) -> Result<(), HeapError> {
        if self.is_frozen() {
            return Err(HeapError::Frozen(self.cnt));
        }
        Ok(())
    }
}
