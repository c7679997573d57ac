use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::address::{Address, LockWordSlot};

use super::header::{ObjectHeader, OBJECT_HEADER_OFFSET};

/// Reference to an object allocated from a [`Heap`](super::heap::Heap).
///
/// The reference points just past the [`ObjectHeader`]; payload words follow it.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(Address);

impl ObjectRef {
    /// The null `ObjectRef`.
    pub const NULL: Self = Self(Address::ZERO);

    #[inline(always)]
    pub fn from_address(address: Address) -> Self {
        Self(address)
    }

    #[inline(always)]
    pub fn as_address(self) -> Address {
        self.0
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[inline(always)]
    pub fn header_address(self) -> Address {
        self.0.offset(OBJECT_HEADER_OFFSET)
    }

    pub fn header(&self) -> &ObjectHeader {
        debug_assert!(!self.is_null());
        unsafe { self.header_address().as_ref() }
    }

    /// Lock word of this object, `offset` bytes away from the reference.
    ///
    /// The offset comes from [`RuntimeLayout`](crate::layout::RuntimeLayout) and
    /// is cached by the caller.
    #[inline(always)]
    pub fn lock_word(self, offset: isize) -> LockWordSlot {
        debug_assert!(!self.is_null());
        unsafe { LockWordSlot::new(self.0.offset(offset)) }
    }

    pub fn payload_words(self) -> usize {
        self.header().payload_words()
    }

    /// Address of payload word `index`.
    pub fn field_address(self, index: usize) -> Address {
        debug_assert!(index < self.payload_words(), "field {index} out of bounds");
        self.0.shift::<usize>(index as isize)
    }

    /// Plain read of payload word `index`.
    ///
    /// # Safety
    ///
    /// Concurrent writers must be excluded by the caller, e.g. by holding the
    /// object's monitor.
    pub unsafe fn read_field(self, index: usize) -> usize {
        self.field_address(index).load::<usize>()
    }

    /// Plain write of payload word `index`.
    ///
    /// # Safety
    ///
    /// Concurrent readers and writers must be excluded by the caller.
    pub unsafe fn write_field(self, index: usize, value: usize) {
        self.field_address(index).store::<usize>(value)
    }

    /// Atomic read of payload word `index`, safe under any amount of sharing.
    pub fn load_field(self, index: usize, order: Ordering) -> usize {
        unsafe { self.field_address(index).atomic_load::<AtomicUsize>(order) }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object@{}", self.0)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self.0)
    }
}
