use bitflags::bitflags;

pub const MAGIC: u8 = 0x53;
pub const VERSION: u8 = 4;

pub const HEADER_SIZE: usize = 8;
pub const ITEM_POINTER_SIZE: usize = 8;

pub const DEFAULT_HEAP_ADDRESS_BITS: u32 = 40;

/// Each packet carries these four pointers in front of the heap's own pointers
pub const MANDATORY_POINTERS: usize = 4;

/// Smallest packet that can carry the header, the mandatory pointers and at least one
///  pointer or payload chunk
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + (MANDATORY_POINTERS + 2) * ITEM_POINTER_SIZE;

pub const NULL_ID: u64 = 0x00;
pub const HEAP_CNT_ID: u64 = 0x01;
pub const HEAP_LENGTH_ID: u64 = 0x02;
pub const PAYLOAD_OFFSET_ID: u64 = 0x03;
pub const PAYLOAD_LENGTH_ID: u64 = 0x04;
pub const DESCRIPTOR_ID: u64 = 0x05;
pub const STREAM_CTRL_ID: u64 = 0x06;

pub const DESCRIPTOR_NAME_ID: u64 = 0x10;
pub const DESCRIPTOR_DESCRIPTION_ID: u64 = 0x11;
pub const DESCRIPTOR_SHAPE_ID: u64 = 0x12;
pub const DESCRIPTOR_FORMAT_ID: u64 = 0x13;
pub const DESCRIPTOR_ID_ID: u64 = 0x14;
pub const DESCRIPTOR_DTYPE_ID: u64 = 0x15;

pub const CTRL_STREAM_START: u64 = 0;
pub const CTRL_DESCRIPTOR_REISSUE: u64 = 1;
pub const CTRL_STREAM_STOP: u64 = 2;
pub const CTRL_DESCRIPTOR_UPDATE: u64 = 3;

/// Returns true for the ids that the protocol itself reserves for packet bookkeeping. These
///  never show up as items of a completed heap.
pub fn is_packet_bookkeeping_id(id: u64) -> bool {
    matches!(id, NULL_ID | HEAP_CNT_ID | HEAP_LENGTH_ID | PAYLOAD_OFFSET_ID | PAYLOAD_LENGTH_ID)
}

bitflags! {
    /// Deviations from the protocol that older peers rely on. They do not change the packet
    ///  layout; they are carried along with heaps so that descriptor decoding further up the
    ///  stack can honour them.
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Hash)]
    pub struct BugCompat: u32 {
        /// Descriptors are sent with 64-40 pointer widths regardless of the stream's width
        const DESCRIPTOR_WIDTHS = 0b0001;
        /// Variable-length dimensions in descriptor shapes use the legacy encoding
        const SHAPE_BITS        = 0b0010;
        /// Numpy payloads are little endian although they are declared big endian
        const SWAP_ENDIAN       = 0b0100;

        const PYSPEAD_0_5_2 = Self::DESCRIPTOR_WIDTHS.bits() | Self::SHAPE_BITS.bits() | Self::SWAP_ENDIAN.bits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::null(NULL_ID, true)]
    #[case::heap_cnt(HEAP_CNT_ID, true)]
    #[case::payload_length(PAYLOAD_LENGTH_ID, true)]
    #[case::descriptor(DESCRIPTOR_ID, false)]
    #[case::stream_ctrl(STREAM_CTRL_ID, false)]
    #[case::user_item(0x1000, false)]
    fn test_is_packet_bookkeeping_id(#[case] id: u64, #[case] expected: bool) {
        assert_eq!(is_packet_bookkeeping_id(id), expected);
    }

    #[test]
    fn test_pyspead_compat_is_union() {
        assert_eq!(BugCompat::PYSPEAD_0_5_2, BugCompat::all());
        assert_eq!(BugCompat::PYSPEAD_0_5_2.bits(), 7);
    }
}
