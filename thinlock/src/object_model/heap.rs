use std::{
    alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    address::Address,
    error::{Error, Result},
};

use super::{
    header::{ObjectHeader, MAX_PAYLOAD_WORDS, OBJECT_REF_OFFSET},
    object::ObjectRef,
};

pub const HEAP_ALIGNMENT: usize = 16;

/// Arena of fixed-layout objects.
///
/// Allocation bumps a shared cursor with a CAS loop; memory is zeroed up front
/// so every lock word starts out unlocked. Objects are never freed individually,
/// they live as long as the heap.
pub struct Heap {
    start: Address,
    limit: Address,
    cursor: AtomicUsize,
    layout: Layout,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(HEAP_ALIGNMENT).next_multiple_of(HEAP_ALIGNMENT);
        let layout = match Layout::from_size_align(capacity, HEAP_ALIGNMENT) {
            Ok(layout) => layout,
            Err(err) => panic!("invalid heap capacity {capacity}: {err}"),
        };
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        let start = Address::from_mut_ptr(ptr);
        log::debug!("heap [{}, {}) reserved", start, start.add(capacity));
        Self {
            start,
            limit: start.add(capacity),
            cursor: AtomicUsize::new(start.as_usize()),
            layout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.limit - self.start
    }

    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed) - self.start.as_usize()
    }

    /// Allocate an object with `payload_words` zeroed words.
    pub fn allocate(&self, payload_words: usize, class_id: usize) -> Result<ObjectRef> {
        let requested = if payload_words > MAX_PAYLOAD_WORDS {
            usize::MAX
        } else {
            (OBJECT_REF_OFFSET + payload_words * size_of::<usize>())
                .next_multiple_of(HEAP_ALIGNMENT)
        };

        let mut current = self.cursor.load(Ordering::Relaxed);
        let start = loop {
            let available = self.limit.as_usize() - current;
            if requested > available {
                return Err(Error::OutOfMemory { requested, available });
            }
            match self.cursor.compare_exchange_weak(
                current,
                current + requested,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break unsafe { Address::from_usize(current) },
                Err(actual) => current = actual,
            }
        };

        unsafe {
            start.store(ObjectHeader::new(payload_words, class_id));
        }
        Ok(ObjectRef::from_address(start.add(OBJECT_REF_OFFSET)))
    }

    /// Walk every allocated object in address order.
    ///
    /// Must not run concurrently with [`allocate`](Self::allocate).
    pub fn objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        let end = self.cursor.load(Ordering::Acquire);
        let mut cursor = self.start;
        std::iter::from_fn(move || {
            if cursor.as_usize() >= end {
                return None;
            }
            let object = ObjectRef::from_address(cursor.add(OBJECT_REF_OFFSET));
            let size = (OBJECT_REF_OFFSET + object.payload_words() * size_of::<usize>())
                .next_multiple_of(HEAP_ALIGNMENT);
            cursor = cursor.add(size);
            Some(object)
        })
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe { dealloc(self.start.to_mut_ptr(), self.layout) }
    }
}
