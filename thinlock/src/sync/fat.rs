use std::{
    sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering},
    time::Duration,
};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::{
    address::LockWordSlot,
    error::{Error, Result},
    object_model::object::ObjectRef,
    threading::ThreadId,
};

use super::{
    lock_word::{self, LockWord},
    parked_scope, Monitor,
};

/// Blocking fallback for object monitors.
///
/// [`ThinLocks`](super::thin::ThinLocks) calls into this only when its fast paths
/// cannot make progress: contention, a lost reservation race, recursion overflow
/// or a lock that is already fat. The implementation owns the transition of the
/// lock word to the fat state.
pub trait FatMonitor: Send + Sync {
    /// Acquire the monitor of `object`, blocking as long as necessary.
    fn enter(&self, object: ObjectRef, slot: LockWordSlot, thread: ThreadId);

    /// Release one hold on a fat lock.
    fn exit(&self, object: ObjectRef, slot: LockWordSlot, thread: ThreadId);

    /// Turn a lock that `thread` holds thin into a fat lock held the same
    /// number of times. No-op if the lock is already fat.
    fn inflate_owned(&self, object: ObjectRef, slot: LockWordSlot, thread: ThreadId);

    /// Release all holds, wait for a notification or the timeout, reacquire.
    fn wait(
        &self,
        object: ObjectRef,
        slot: LockWordSlot,
        thread: ThreadId,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Wake one waiter, or all of them.
    fn notify(&self, object: ObjectRef, slot: LockWordSlot, thread: ThreadId, all: bool) -> Result<()>;

    /// Current owner, thin or fat.
    fn owner(&self, slot: LockWordSlot) -> Option<ThreadId>;

    /// Called after the last thin hold on `object` was released, so threads
    /// parked in [`enter`](Self::enter) behind the thin owner can retry.
    fn thin_released(&self, object: ObjectRef, slot: LockWordSlot);
}

/// A heavy monitor that an object's lock word points to once inflated.
pub struct InflatedMonitor {
    monitor: Monitor<()>,
    owner: AtomicU32,
}

impl InflatedMonitor {
    fn new() -> Self {
        Self {
            monitor: Monitor::new(()),
            owner: AtomicU32::new(0),
        }
    }

    fn acquire(&self, thread: ThreadId, count: usize) {
        self.monitor.enter_with_count(count);
        self.owner.store(thread.get(), Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// `thread` must hold the monitor.
    unsafe fn release(&self, thread: ThreadId) {
        debug_assert!(self.is_held_by(thread), "thread {thread} releases a monitor it does not hold");
        if self.monitor.recursion_count() == 1 {
            self.owner.store(0, Ordering::Relaxed);
        }
        unsafe { self.monitor.exit() };
    }

    /// Only the holder writes its own id here, so a thread asking about itself
    /// always gets an exact answer.
    pub fn is_held_by(&self, thread: ThreadId) -> bool {
        self.owner.load(Ordering::Relaxed) == thread.get()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_usize(self.owner.load(Ordering::Relaxed) as usize)
    }

    /// Number of holds. Only meaningful for the holder.
    pub fn recursion_count(&self) -> usize {
        self.monitor.recursion_count()
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let owner = self.owner.swap(0, Ordering::Relaxed);
        let timed_out = unsafe { self.monitor.wait_raw(timeout) };
        self.owner.store(owner, Ordering::Relaxed);
        timed_out
    }
}

/// Default [`FatMonitor`]: an append-only table of [`InflatedMonitor`]s. A fat
/// lock word stores the index of its monitor.
///
/// A non-owner inflates only from an unlocked word, by CAS, with the new
/// monitor already held. While another thread holds the word thin it spins for
/// a while, then parks until a thin owner lets go of its word. The owner updates
/// its word with plain stores that a concurrent CAS would race with. Monitors
/// are never deflated.
pub struct InflatedMonitors {
    table: boxcar::Vec<InflatedMonitor>,
    /// Monitors that lost their inflation race and were never installed.
    spares: Mutex<Vec<usize>>,
    thin_waiters: ThinWaiters,
}

/// Threads parked behind a thin owner. One condition variable serves every
/// object; woken threads recheck their own word.
struct ThinWaiters {
    parked: AtomicUsize,
    lock: Mutex<()>,
    released: Condvar,
}

impl Default for InflatedMonitors {
    fn default() -> Self {
        Self::new()
    }
}

impl InflatedMonitors {
    pub fn new() -> Self {
        Self {
            table: boxcar::Vec::new(),
            spares: Mutex::new(Vec::new()),
            thin_waiters: ThinWaiters {
                parked: AtomicUsize::new(0),
                lock: Mutex::new(()),
                released: Condvar::new(),
            },
        }
    }

    /// Number of monitors ever created, installed or spare.
    pub fn count(&self) -> usize {
        self.table.count()
    }

    pub fn monitor(&self, index: usize) -> &InflatedMonitor {
        match self.table.get(index) {
            Some(monitor) => monitor,
            None => panic!("lock word refers to unknown monitor #{index}"),
        }
    }

    /// Monitor of a fat lock word.
    pub fn monitor_of(&self, slot: LockWordSlot) -> Option<&InflatedMonitor> {
        let word = slot.load(Ordering::Acquire);
        lock_word::is_fat(word).then(|| self.monitor(lock_word::fat_index(word)))
    }

    fn allocate_held(&self, thread: ThreadId, count: usize) -> usize {
        let index = self.spares.lock().pop().unwrap_or_else(|| {
            let index = self.table.push(InflatedMonitor::new());
            log::debug!("monitor table grew to {} entries", index + 1);
            index
        });
        self.monitor(index).acquire(thread, count);
        index
    }

    fn retire_spare(&self, index: usize, thread: ThreadId) {
        unsafe { self.monitor(index).release(thread) };
        self.spares.lock().push(index);
    }

    /// Try to install a held monitor into the unlocked `word`. A monitor that
    /// loses the CAS stays in `spare` for the next attempt.
    fn inflate_free(
        &self,
        object: ObjectRef,
        slot: LockWordSlot,
        thread: ThreadId,
        word: usize,
        spare: &mut Option<usize>,
    ) -> bool {
        debug_assert!(lock_word::has_no_locks(word));
        let index = match spare.take() {
            Some(index) => index,
            None => self.allocate_held(thread, 1),
        };
        if slot.compare_and_swap(word, lock_word::encode_fat(index)) {
            log::debug!("inflated {object} into monitor #{index} for thread {thread}");
            return true;
        }
        *spare = Some(index);
        false
    }

    /// Park until the word stops being held thin by another thread.
    fn park_behind_thin_owner(&self, object: ObjectRef, slot: LockWordSlot, thread: ThreadId) {
        let waiters = &self.thin_waiters;
        parked_scope(|| {
            let mut guard = waiters.lock.lock();
            waiters.parked.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            let word = slot.load(Ordering::SeqCst);
            if !lock_word::is_fat(word)
                && !lock_word::has_no_locks(word)
                && lock_word::owner(word) != Some(thread)
            {
                log::trace!("thread {thread} parks behind {:?} of {object}", LockWord(word));
                waiters.released.wait(&mut guard);
            }
            waiters.parked.fetch_sub(1, Ordering::Relaxed);
        });
    }

    fn wake_thin_waiters(&self) {
        let waiters = &self.thin_waiters;
        // Pairs with the increment and word load in `park_behind_thin_owner`:
        // either the parker sees the new word or we see the parker.
        fence(Ordering::SeqCst);
        if waiters.parked.load(Ordering::Relaxed) != 0 {
            let _guard = waiters.lock.lock();
            waiters.released.notify_all();
        }
    }

    /// Replace a thin word owned by `thread` with a fat one carrying the same
    /// holds. The owner is the only writer of an owned word, so no CAS.
    fn install_owned(&self, object: ObjectRef, slot: LockWordSlot, thread: ThreadId, word: usize) -> usize {
        debug_assert_eq!(lock_word::owner(word), Some(thread));
        let holds = lock_word::thin_hold_count(word);
        let index = self.allocate_held(thread, holds);
        slot.store(lock_word::encode_fat(index), Ordering::Release);
        log::debug!("thread {thread} inflated its own lock on {object} into monitor #{index} ({holds} holds)");
        // Threads parked behind the thin word now queue on the monitor.
        self.wake_thin_waiters();
        index
    }
}

impl FatMonitor for InflatedMonitors {
    fn enter(&self, object: ObjectRef, slot: LockWordSlot, thread: ThreadId) {
        log::trace!(
            "slow enter of {object} by thread {thread}: {:?}",
            LockWord(slot.load(Ordering::Relaxed))
        );
        let backoff = Backoff::new();
        let mut spare = None;
        loop {
            let word = slot.load(Ordering::Acquire);

            if lock_word::is_fat(word) {
                if let Some(index) = spare.take() {
                    self.retire_spare(index, thread);
                }
                self.monitor(lock_word::fat_index(word)).acquire(thread, 1);
                return;
            }

            if lock_word::owner(word) == Some(thread) {
                // Recursion count ran into the bound.
                let index = self.install_owned(object, slot, thread, word);
                self.monitor(index).acquire(thread, 1);
                return;
            }

            if lock_word::has_no_locks(word) {
                if self.inflate_free(object, slot, thread, word, &mut spare) {
                    return;
                }
                continue;
            }

            // Held thin by another thread; wait for it to let go.
            if backoff.is_completed() {
                self.park_behind_thin_owner(object, slot, thread);
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
    }

    fn exit(&self, _object: ObjectRef, slot: LockWordSlot, thread: ThreadId) {
        let word = slot.load(Ordering::Relaxed);
        debug_assert!(lock_word::is_fat(word));
        unsafe { self.monitor(lock_word::fat_index(word)).release(thread) };
    }

    fn inflate_owned(&self, object: ObjectRef, slot: LockWordSlot, thread: ThreadId) {
        let word = slot.load(Ordering::Relaxed);
        if !lock_word::is_fat(word) {
            self.install_owned(object, slot, thread, word);
        }
    }

    fn wait(
        &self,
        object: ObjectRef,
        slot: LockWordSlot,
        thread: ThreadId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let word = slot.load(Ordering::Acquire);
        let index = if lock_word::is_fat(word) {
            lock_word::fat_index(word)
        } else if lock_word::owner(word) == Some(thread) {
            // Waiters need a condition variable.
            self.install_owned(object, slot, thread, word)
        } else {
            return Err(Error::IllegalMonitorState { thread, object });
        };

        let monitor = self.monitor(index);
        if !monitor.is_held_by(thread) {
            return Err(Error::IllegalMonitorState { thread, object });
        }
        if monitor.wait(timeout) {
            log::trace!("thread {thread} timed out waiting on {object}");
        }
        Ok(())
    }

    fn notify(&self, object: ObjectRef, slot: LockWordSlot, thread: ThreadId, all: bool) -> Result<()> {
        let word = slot.load(Ordering::Acquire);
        if !lock_word::is_fat(word) {
            // Nobody can wait on a thin lock.
            return if lock_word::owner(word) == Some(thread) {
                Ok(())
            } else {
                Err(Error::IllegalMonitorState { thread, object })
            };
        }

        let monitor = self.monitor(lock_word::fat_index(word));
        if !monitor.is_held_by(thread) {
            return Err(Error::IllegalMonitorState { thread, object });
        }
        if all {
            monitor.monitor.notify_all();
        } else {
            monitor.monitor.notify();
        }
        Ok(())
    }

    fn owner(&self, slot: LockWordSlot) -> Option<ThreadId> {
        let word = slot.load(Ordering::Acquire);
        if lock_word::is_fat(word) {
            self.monitor(lock_word::fat_index(word)).owner()
        } else {
            lock_word::owner(word)
        }
    }

    #[inline]
    fn thin_released(&self, _object: ObjectRef, _slot: LockWordSlot) {
        self.wake_thin_waiters();
    }
}
