use std::sync::OnceLock;

use crate::{object_model::header::LOCK_WORD_OFFSET, threading::Thread};

/// Byte offsets the lock core needs to find its data.
///
/// The object model and the thread model own these numbers. They are queried
/// once, on first use, and cached for the lifetime of the process. Hot paths
/// copy them into their own state instead of consulting this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLayout {
    /// Offset of the lock word from an object reference. Negative: the header
    /// sits in front of the object.
    pub lock_word_offset: isize,
    /// Offset of the thread id within the TLS block.
    pub thread_id_offset: usize,
    /// Offset of the managed thread object within the TLS block.
    pub managed_thread_offset: usize,
}

static LAYOUT: OnceLock<RuntimeLayout> = OnceLock::new();

impl RuntimeLayout {
    /// Ask the object and thread models for their offsets.
    pub fn query() -> Self {
        Self {
            lock_word_offset: LOCK_WORD_OFFSET,
            thread_id_offset: Thread::THREAD_ID_OFFSET,
            managed_thread_offset: Thread::MANAGED_THREAD_OFFSET,
        }
    }

    /// Cached layout.
    pub fn get() -> &'static Self {
        LAYOUT.get_or_init(|| {
            let layout = Self::query();
            log::debug!("runtime layout: {:?}", layout);
            layout
        })
    }
}
