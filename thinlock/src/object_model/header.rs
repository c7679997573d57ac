use std::{mem::offset_of, sync::atomic::AtomicUsize};

use easy_bitfield::*;

/// Object header in front of every object.
///
/// ```text
///            header                      object reference
/// +----------------+----------------+    |
/// |    metadata    |   lock word    |    v  payload words ...
/// +----------------+----------------+----+----------------------
/// ```
///
/// The lock word is owned by the monitor core and must never be updated by
/// anything else: a thin owner writes it with plain stores.
#[repr(C)]
pub struct ObjectHeader {
    pub metadata: AtomicBitfieldContainer<usize>,
    pub lock_word: AtomicUsize,
}

/// Offset from allocation start to the object reference.
pub const OBJECT_REF_OFFSET: usize = size_of::<ObjectHeader>();
/// Object header behind object.
pub const OBJECT_HEADER_OFFSET: isize = -(OBJECT_REF_OFFSET as isize);
/// Lock word relative to the object reference.
pub const LOCK_WORD_OFFSET: isize = OBJECT_HEADER_OFFSET + offset_of!(ObjectHeader, lock_word) as isize;

pub const PAYLOAD_BITS: usize = usize::BITS as usize / 2;

pub type PayloadWordsField = BitField<usize, usize, 0, PAYLOAD_BITS, false>;
pub type ClassIdField = BitField<
    usize,
    usize,
    { PayloadWordsField::NEXT_BIT },
    { usize::BITS as usize - PAYLOAD_BITS },
    false,
>;

/// Largest payload, in words, a header can describe.
pub const MAX_PAYLOAD_WORDS: usize = (1 << PAYLOAD_BITS) - 1;

impl ObjectHeader {
    pub fn new(payload_words: usize, class_id: usize) -> Self {
        Self {
            metadata: AtomicBitfieldContainer::new(ClassIdField::update(
                class_id,
                PayloadWordsField::encode(payload_words),
            )),
            lock_word: AtomicUsize::new(0),
        }
    }

    pub fn payload_words(&self) -> usize {
        self.metadata.read::<PayloadWordsField>()
    }

    /// Embedder-defined type tag.
    pub fn class_id(&self) -> usize {
        self.metadata.read::<ClassIdField>()
    }

    pub fn set_class_id(&self, class_id: usize) {
        self.metadata.update_synchronized::<ClassIdField>(class_id);
    }
}
