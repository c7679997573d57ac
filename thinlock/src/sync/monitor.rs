use std::{
    mem::ManuallyDrop,
    num::NonZeroU64,
    ops::Deref,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::threading::parked_scope;

/// Key of the calling OS thread, valid whether or not the thread is attached to
/// the runtime.
fn get_thread_id() -> NonZeroU64 {
    thread_local! {
        static KEY: u8 = const { 0 };
    }
    KEY.with(|x| {
        NonZeroU64::new(x as *const _ as u64).expect("thread-local variable address is null")
    })
}

/// Implementation of a heavy lock and condition variable implemented using
/// the primitives available from `parking_lot`. Currently we use
/// a `Mutex` and `Condvar`.
///
/// This is the blocking half of object locking: inflated object monitors are
/// built on it, and it also guards runtime-internal state. It is roughly a
/// reentrant mutex combined with a condition variable, except:
///
/// * It can be held without a guard ([`enter`](Self::enter) and
///   [`exit`](Self::exit)), because object monitors are entered and exited by
///   separate calls.
/// * Blocking marks the calling thread as parked, see [`parked_scope`].
/// * `wait` releases every recursive hold and restores them on wakeup.
/// * It does not provide mutable access to the protected data as it is unsound;
///   use `RefCell` to mutate the protected data.
pub struct Monitor<T> {
    mutex: Mutex<T>,
    cvar: Condvar,
    rec_count: AtomicUsize,
    holder: AtomicU64,
}

impl<T> Monitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            mutex: Mutex::new(value),
            cvar: Condvar::new(),
            rec_count: AtomicUsize::new(0),
            holder: AtomicU64::new(0),
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == get_thread_id().get()
    }

    /// Number of holds. Only meaningful for the holder.
    pub fn recursion_count(&self) -> usize {
        self.rec_count.load(Ordering::Relaxed)
    }

    fn acquire(&self, count: usize) {
        let my_slot = get_thread_id().get();
        if self.holder.load(Ordering::Relaxed) == my_slot {
            self.rec_count.fetch_add(count, Ordering::Relaxed);
            return;
        }

        let guard = match self.mutex.try_lock() {
            Some(guard) => guard,
            None => parked_scope(|| self.mutex.lock()),
        };
        std::mem::forget(guard);
        self.holder.store(my_slot, Ordering::Relaxed);
        self.rec_count.store(count, Ordering::Relaxed);
    }

    pub fn lock(&self) -> MonitorGuard<'_, T> {
        self.acquire(1);
        MonitorGuard {
            monitor: self,
            guard: ManuallyDrop::new(unsafe { self.mutex.make_guard_unchecked() }),
        }
    }

    pub fn try_lock(&self) -> Option<MonitorGuard<'_, T>> {
        if !self.is_held_by_current_thread() {
            std::mem::forget(self.mutex.try_lock()?);
            self.holder.store(get_thread_id().get(), Ordering::Relaxed);
        }
        self.rec_count.fetch_add(1, Ordering::Relaxed);
        Some(MonitorGuard {
            monitor: self,
            guard: ManuallyDrop::new(unsafe { self.mutex.make_guard_unchecked() }),
        })
    }

    /// Take one hold without a guard. Balance with [`exit`](Self::exit).
    pub fn enter(&self) {
        self.acquire(1);
    }

    /// Take `count` holds at once. Used when a lock that is already held
    /// `count` times elsewhere moves into this monitor.
    pub fn enter_with_count(&self, count: usize) {
        debug_assert!(count > 0);
        self.acquire(count);
    }

    /// Release one hold taken by [`enter`](Self::enter).
    ///
    /// # Safety
    ///
    /// The calling thread must hold the monitor.
    pub unsafe fn exit(&self) {
        debug_assert!(self.is_held_by_current_thread(), "monitor released by a non-holder");
        if self.rec_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.holder.store(0, Ordering::Relaxed);
            unsafe { self.mutex.force_unlock() };
        }
    }

    /// Release all holds, wait for a notification (or `timeout`), then restore
    /// the holds. Returns `true` if the wait timed out.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the monitor.
    pub unsafe fn wait_raw(&self, timeout: Option<Duration>) -> bool {
        debug_assert!(self.is_held_by_current_thread(), "wait on a monitor not held");
        let mut guard = unsafe { self.mutex.make_guard_unchecked() };
        let timed_out = self.wait_impl(&mut guard, timeout);
        std::mem::forget(guard);
        timed_out
    }

    fn wait_impl(&self, guard: &mut MutexGuard<'_, T>, timeout: Option<Duration>) -> bool {
        let rec_count = self.rec_count.swap(0, Ordering::Relaxed);
        let holder = self.holder.swap(0, Ordering::Relaxed);
        let timed_out = parked_scope(|| match timeout {
            Some(timeout) => self.cvar.wait_for(guard, timeout).timed_out(),
            None => {
                self.cvar.wait(guard);
                false
            }
        });
        self.rec_count.store(rec_count, Ordering::Relaxed);
        self.holder.store(holder, Ordering::Relaxed);
        timed_out
    }

    pub fn notify(&self) {
        self.cvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }
}

pub struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
    guard: ManuallyDrop<MutexGuard<'a, T>>,
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> MonitorGuard<'_, T> {
    pub fn wait(&mut self) {
        self.monitor.wait_impl(&mut self.guard, None);
    }

    /// Returns `true` if the wait timed out.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        self.monitor.wait_impl(&mut self.guard, Some(timeout))
    }

    pub fn notify(&self) {
        self.monitor.cvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.monitor.cvar.notify_all();
    }

    pub fn monitor(&self) -> &Monitor<T> {
        self.monitor
    }
}

impl<T> Drop for MonitorGuard<'_, T> {
    fn drop(&mut self) {
        if self.monitor.rec_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.monitor.holder.store(0, Ordering::Relaxed);
            unsafe { ManuallyDrop::drop(&mut self.guard) };
        }
    }
}
