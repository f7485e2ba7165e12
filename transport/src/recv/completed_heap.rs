use bytes::Bytes;
use spead_protocol::constants::BugCompat;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedItem {
    pub id: u64,
    /// The item's value. For immediate items, these are all the value bits of the item pointer,
    ///  i.e. `heap_address_bits / 8` bytes, regardless of how many bytes the sender put there.
    pub data: Bytes,
    pub is_immediate: bool,
}

/// A fully received heap. Item values are slices of one shared payload buffer.
#[derive(Debug, Clone)]
pub struct CompletedHeap {
    pub(crate) cnt: u64,
    pub(crate) bug_compat: BugCompat,
    pub(crate) descriptors: Vec<Bytes>,
    pub(crate) items: Vec<ReceivedItem>,
    pub(crate) end_of_stream: bool,
}

impl CompletedHeap {
    pub fn cnt(&self) -> u64 {
        self.cnt
    }

    pub fn bug_compat(&self) -> BugCompat {
        self.bug_compat
    }

    /// raw descriptors, in the order their pointers were received
    pub fn descriptors(&self) -> &[Bytes] {
        &self.descriptors
    }

    pub fn items(&self) -> &[ReceivedItem] {
        &self.items
    }

    pub fn item(&self, id: u64) -> Option<&ReceivedItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// whether the sender marked this heap as the last one of the stream
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.descriptors.is_empty()
    }
}
