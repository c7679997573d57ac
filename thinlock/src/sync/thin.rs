//! Thin object locks.
//!
//! Every object carries a lock word (see [`lock_word`]). A thread that already
//! holds an object's lock re-enters and leaves it with plain stores. A thread
//! taking a free lock does one compare-and-swap. Everything else is handed to a
//! [`FatMonitor`].

use std::{sync::atomic::Ordering, time::Duration};

use crate::{
    address::LockWordSlot,
    error::Result,
    layout::RuntimeLayout,
    object_model::object::ObjectRef,
    threading::{tls_base_address, ThreadId, ThreadIdentity},
};

use super::{
    fat::{FatMonitor, InflatedMonitors},
    lock_word::{self, LockState, LockWord},
};

/// Monitor entry and exit for heap objects.
///
/// Offsets are copied out of [`RuntimeLayout`] on construction so the fast
/// paths do no lookups beyond the thread-local base.
pub struct ThinLocks<F: FatMonitor = InflatedMonitors> {
    lock_word_offset: isize,
    thread_id_offset: usize,
    fat: F,
}

impl Default for ThinLocks<InflatedMonitors> {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinLocks<InflatedMonitors> {
    pub fn new() -> Self {
        Self::with_fat_monitor(InflatedMonitors::new())
    }
}

impl<F: FatMonitor> ThinLocks<F> {
    pub fn with_fat_monitor(fat: F) -> Self {
        let layout = RuntimeLayout::get();
        Self {
            lock_word_offset: layout.lock_word_offset,
            thread_id_offset: layout.thread_id_offset,
            fat,
        }
    }

    pub fn fat_monitor(&self) -> &F {
        &self.fat
    }

    #[inline(always)]
    fn slot(&self, object: ObjectRef) -> LockWordSlot {
        object.lock_word(self.lock_word_offset)
    }

    #[inline(always)]
    fn current_id(&self) -> ThreadId {
        ThreadIdentity::load_id(tls_base_address(), self.thread_id_offset)
    }

    /// Acquire the monitor of `object`. Never fails; blocks while another
    /// thread holds it.
    #[inline]
    pub fn enter(&self, object: ObjectRef) {
        let slot = self.slot(object);
        let word = slot.load(Ordering::Relaxed);
        let thread = self.current_id();

        if lock_word::is_unlocked_or_self(word, thread) && lock_word::is_fast_path_eligible(word) {
            // Only the owner writes an owned thin word.
            slot.store(lock_word::with_incremented_recursion(word), Ordering::Relaxed);
            return;
        }

        if lock_word::has_no_locks(word) {
            let candidate = lock_word::encode_owner(thread) ^ word;
            if slot.compare_and_swap(word, candidate) {
                return;
            }
        }

        self.fat.enter(object, slot, thread);
    }

    /// Release one hold on the monitor of `object`.
    ///
    /// The caller must hold the monitor. Debug builds, and builds with the
    /// `checked_exit` feature, check this for thin locks.
    #[inline]
    pub fn exit(&self, object: ObjectRef) {
        let slot = self.slot(object);
        let word = slot.load(Ordering::Relaxed);

        if cfg!(any(debug_assertions, feature = "checked_exit")) && !lock_word::is_fat(word) {
            let thread = self.current_id();
            assert!(
                lock_word::is_unlocked_or_self(word, thread),
                "thread {thread} exits {object} it does not hold: {:?}",
                LockWord(word)
            );
        }

        if word & (lock_word::FAT_MASK | lock_word::RECURSION_MASK) != 0 {
            if lock_word::is_fat(word) {
                self.fat.exit(object, slot, self.current_id());
            } else {
                slot.store(lock_word::with_decremented_recursion(word), Ordering::Relaxed);
            }
            return;
        }

        // Last thin hold: owner, fat and recursion bits all go back to zero.
        slot.store(0, Ordering::Release);
        self.fat.thin_released(object, slot);
    }

    /// Release the monitor of `object`, wait until notified or until `timeout`
    /// passes, then take it back with the same number of holds.
    pub fn wait(&self, object: ObjectRef, timeout: Option<Duration>) -> Result<()> {
        self.fat.wait(object, self.slot(object), self.current_id(), timeout)
    }

    pub fn notify(&self, object: ObjectRef) -> Result<()> {
        self.fat.notify(object, self.slot(object), self.current_id(), false)
    }

    pub fn notify_all(&self, object: ObjectRef) -> Result<()> {
        self.fat.notify(object, self.slot(object), self.current_id(), true)
    }

    /// Does the calling thread hold the monitor of `object`?
    pub fn holds_lock(&self, object: ObjectRef) -> bool {
        self.owner(object) == Some(self.current_id())
    }

    pub fn owner(&self, object: ObjectRef) -> Option<ThreadId> {
        self.fat.owner(self.slot(object))
    }

    /// State of the lock word as seen by the calling thread.
    pub fn lock_state(&self, object: ObjectRef) -> LockState {
        LockState::of(self.lock_word(object), self.current_id())
    }

    /// Raw lock word, for diagnostics.
    pub fn lock_word(&self, object: ObjectRef) -> usize {
        self.slot(object).load(Ordering::Acquire)
    }

    /// Run `f` while holding the monitor of `object`.
    pub fn synchronized<R>(&self, object: ObjectRef, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock(object);
        f()
    }

    pub fn lock(&self, object: ObjectRef) -> ObjectMonitorGuard<'_, F> {
        self.enter(object);
        ObjectMonitorGuard { locks: self, object }
    }
}

/// Holds one hold on an object's monitor; released on drop.
pub struct ObjectMonitorGuard<'a, F: FatMonitor = InflatedMonitors> {
    locks: &'a ThinLocks<F>,
    object: ObjectRef,
}

impl<F: FatMonitor> ObjectMonitorGuard<'_, F> {
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn wait(&self) -> Result<()> {
        self.locks.wait(self.object, None)
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<()> {
        self.locks.wait(self.object, Some(timeout))
    }

    pub fn notify(&self) -> Result<()> {
        self.locks.notify(self.object)
    }

    pub fn notify_all(&self) -> Result<()> {
        self.locks.notify_all(self.object)
    }
}

impl<F: FatMonitor> Drop for ObjectMonitorGuard<'_, F> {
    fn drop(&mut self) {
        self.locks.exit(self.object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        object_model::heap::Heap,
        sync::lock_word::{RECURSION_BOUND, RECURSION_UNIT},
        threading::Thread,
    };

    #[test]
    fn reservation_and_release_restore_zero_word() {
        Thread::main(|| {
            let heap = Heap::new(1024);
            let obj = heap.allocate(1, 0).unwrap();
            let locks = ThinLocks::new();
            let me = ThreadIdentity::current_id();

            locks.enter(obj);
            assert_eq!(locks.lock_word(obj), lock_word::encode_owner(me));
            assert_eq!(locks.lock_state(obj), LockState::Reserved);
            assert!(locks.holds_lock(obj));

            locks.exit(obj);
            assert_eq!(locks.lock_word(obj), 0);
            assert_eq!(locks.lock_state(obj), LockState::Unlocked);
            assert_eq!(locks.owner(obj), None);
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "not attached")]
    fn unattached_thread_cannot_enter() {
        let heap = Heap::new(1024);
        let obj = heap.allocate(1, 0).unwrap();
        ThinLocks::new().enter(obj);
    }

    #[test]
    fn recursion_is_counted_in_the_word() {
        Thread::main(|| {
            let heap = Heap::new(1024);
            let obj = heap.allocate(1, 0).unwrap();
            let locks = ThinLocks::new();
            let me = ThreadIdentity::current_id();

            for _ in 0..3 {
                locks.enter(obj);
            }
            assert_eq!(
                locks.lock_word(obj),
                lock_word::encode_owner(me) + 2 * RECURSION_UNIT
            );
            assert_eq!(locks.lock_state(obj), LockState::ThinOwnedBySelf);

            for _ in 0..3 {
                locks.exit(obj);
            }
            assert_eq!(locks.lock_word(obj), 0);
            assert_eq!(locks.fat_monitor().count(), 0);
        })
        .unwrap();
    }

    #[test]
    fn recursion_overflow_inflates() {
        Thread::main(|| {
            let heap = Heap::new(1024);
            let obj = heap.allocate(1, 0).unwrap();
            let locks = ThinLocks::new();
            let depth = RECURSION_BOUND + 3;

            for _ in 0..depth {
                locks.enter(obj);
            }
            assert_eq!(locks.lock_state(obj), LockState::Fat);
            assert!(locks.holds_lock(obj));

            for _ in 0..depth {
                locks.exit(obj);
            }
            assert!(!locks.holds_lock(obj));
            assert_eq!(locks.owner(obj), None);
            assert!(lock_word::is_fat(locks.lock_word(obj)));
        })
        .unwrap();
    }

    #[test]
    fn guard_releases_on_drop() {
        Thread::main(|| {
            let heap = Heap::new(1024);
            let obj = heap.allocate(1, 0).unwrap();
            let locks = ThinLocks::new();

            let value = locks.synchronized(obj, || {
                assert!(locks.holds_lock(obj));
                let guard = locks.lock(obj);
                assert_eq!(guard.object(), obj);
                guard.notify().unwrap();
                42
            });
            assert_eq!(value, 42);
            assert_eq!(locks.lock_word(obj), 0);
        })
        .unwrap();
    }

    #[test]
    fn notify_without_holding_fails() {
        Thread::main(|| {
            let heap = Heap::new(1024);
            let obj = heap.allocate(1, 0).unwrap();
            let locks = ThinLocks::new();

            match locks.notify(obj) {
                Err(Error::IllegalMonitorState { thread, object }) => {
                    assert_eq!(thread, ThreadIdentity::current_id());
                    assert_eq!(object, obj);
                }
                other => panic!("expected illegal monitor state, got {other:?}"),
            }
        })
        .unwrap();
    }

    #[test]
    fn timed_wait_keeps_holds() {
        Thread::main(|| {
            let heap = Heap::new(1024);
            let obj = heap.allocate(1, 0).unwrap();
            let locks = ThinLocks::new();

            locks.enter(obj);
            locks.enter(obj);
            locks.wait(obj, Some(Duration::from_millis(5))).unwrap();
            assert_eq!(locks.lock_state(obj), LockState::Fat);
            assert!(locks.holds_lock(obj));

            locks.exit(obj);
            assert!(locks.holds_lock(obj));
            locks.exit(obj);
            assert!(!locks.holds_lock(obj));
        })
        .unwrap();
    }
}
