use std::{
    cell::Cell,
    cell::RefCell,
    fmt,
    mem::offset_of,
    num::NonZeroU32,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, LazyLock,
    },
    thread::JoinHandle,
};

use atomic::Atomic;

use crate::{
    address::Address,
    error::{Error, Result},
    layout::RuntimeLayout,
    object_model::object::ObjectRef,
    sync::{lock_word::MAX_OWNER, Monitor},
};

/// Upper bound on simultaneously live threads. Ids are small integers, and the
/// thin lock word must be able to hold every one of them.
pub const MAX_THREADS: usize = if MAX_OWNER < u16::MAX as usize {
    MAX_OWNER
} else {
    u16::MAX as usize
};

/// Small integer naming a live thread. Zero is reserved for "no owner" in lock
/// words, hence the `NonZeroU32`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU32);

impl ThreadId {
    pub fn from_usize(raw: usize) -> Option<Self> {
        u32::try_from(raw).ok().and_then(NonZeroU32::new).map(Self)
    }

    pub const fn get(self) -> u32 {
        self.0.get()
    }

    pub const fn as_usize(self) -> usize {
        self.0.get() as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

/// Threads use a small state machine so diagnostics can tell running threads
/// from threads parked inside a fat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadState {
    /// Registered, but `start()` has not yet spawned the OS thread.
    #[default]
    New,
    /// Executing managed code.
    Running,
    /// Parked: waiting behind another thread's lock or inside `wait()`.
    Blocked,
    /// Finished. The id has been returned to the manager and may be reused.
    Terminated,
}

unsafe impl bytemuck::NoUninit for ThreadState {}

/// Per-thread record. Its address is the thread's TLS base: the lock core finds
/// the thread id and the managed thread object by adding fixed offsets to it
/// (see [`RuntimeLayout`]), so the layout is `repr(C)`.
#[repr(C)]
pub struct Thread {
    thread_id: ThreadId,
    /// Language-level thread object, if the embedder provided one.
    managed_thread: AtomicUsize,
    exec_status: Atomic<ThreadState>,
    /// Is the thread no longer executing user code? Protected by `monitor`.
    is_joinable: AtomicBool,
    monitor: Monitor<()>,
    name: Option<String>,
}

impl Thread {
    /// Offset of the thread id from the TLS base.
    pub const THREAD_ID_OFFSET: usize = offset_of!(Thread, thread_id);
    /// Offset of the managed thread object from the TLS base.
    pub const MANAGED_THREAD_OFFSET: usize = offset_of!(Thread, managed_thread);

    /// Create a thread record and reserve an id for it.
    pub fn new(name: Option<String>) -> Result<Arc<Self>> {
        let thread_id = thread_manager().reserve_id()?;
        let thread = Arc::new(Self {
            thread_id,
            managed_thread: AtomicUsize::new(0),
            exec_status: Atomic::new(ThreadState::New),
            is_joinable: AtomicBool::new(false),
            monitor: Monitor::new(()),
            name,
        });
        thread_manager().add_thread(thread.clone());
        Ok(thread)
    }

    /// Create a named thread and start it.
    pub fn spawn<F, R>(name: impl Into<String>, f: F) -> Result<JoinHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let thread = Self::new(Some(name.into()))?;
        Ok(thread.start(f))
    }

    /// Start execution of `self` on a new OS thread.
    ///
    /// A panic in `f` is re-raised after the thread has been torn down, so
    /// `JoinHandle::join` reports it.
    pub fn start<F, R>(self: &Arc<Self>, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let this = self.clone();
        let mut builder = std::thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        builder
            .spawn(move || this.startoff(f))
            .unwrap_or_else(|err| panic!("failed to spawn OS thread: {err}"))
    }

    /// Attach the calling OS thread for the duration of `f`.
    pub fn main<F, R>(f: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        assert!(
            try_current_thread().is_none(),
            "OS thread is already attached to the runtime"
        );
        let this = Self::new(Some("main".to_string()))?;
        Ok(this.startoff(f))
    }

    fn startoff<F, R>(self: &Arc<Self>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        init_current_thread(self.clone());
        self.set_exec_status(ThreadState::Running);
        log::trace!("thread {} attached", self.thread_id);

        let result = std::panic::catch_unwind(AssertUnwindSafe(f));

        self.terminate();

        match result {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    fn terminate(&self) {
        log::trace!("thread {} terminating", self.thread_id);
        let guard = self.monitor.lock();
        self.set_exec_status(ThreadState::Terminated);
        self.is_joinable.store(true, Ordering::Relaxed);
        guard.notify_all();
        drop(guard);
        thread_manager().remove_thread(self.thread_id);
        deinit_current_thread();
    }

    /// Block until the thread has finished running user code.
    pub fn join(&self) {
        let mut guard = self.monitor.lock();
        while !self.is_joinable.load(Ordering::Relaxed) {
            guard.wait();
        }
    }

    pub fn current() -> &'static Thread {
        current_thread()
    }

    pub fn id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn get_exec_status(&self) -> ThreadState {
        self.exec_status.load(Ordering::Relaxed)
    }

    pub(crate) fn set_exec_status(&self, state: ThreadState) {
        self.exec_status.store(state, Ordering::Relaxed);
    }

    pub fn is_blocked(&self) -> bool {
        self.get_exec_status() == ThreadState::Blocked
    }

    pub fn managed_thread(&self) -> ObjectRef {
        ObjectRef::from_address(unsafe {
            Address::from_usize(self.managed_thread.load(Ordering::Acquire))
        })
    }

    /// Associate the language-level thread object with this thread.
    pub fn set_managed_thread(&self, object: ObjectRef) {
        self.managed_thread
            .store(object.as_address().as_usize(), Ordering::Release);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.thread_id)
            .field("name", &self.name)
            .field("state", &self.get_exec_status())
            .finish()
    }
}

/// Resolves the calling thread's identity through its TLS block.
pub struct ThreadIdentity;

impl ThreadIdentity {
    /// Id of the calling thread. O(1), never blocks.
    ///
    /// # Panics
    ///
    /// If the calling OS thread is not attached to the runtime.
    #[inline(always)]
    pub fn current_id() -> ThreadId {
        Self::load_id(tls_base_address(), RuntimeLayout::get().thread_id_offset)
    }

    /// Language-level thread object of the calling thread. Null if the embedder
    /// never set one.
    ///
    /// # Panics
    ///
    /// If the calling OS thread is not attached to the runtime.
    pub fn current_managed_thread_handle() -> ObjectRef {
        Self::load_managed_thread(tls_base_address(), RuntimeLayout::get().managed_thread_offset)
    }

    #[inline(always)]
    pub(crate) fn load_id(tls: Address, offset: usize) -> ThreadId {
        assert!(!tls.is_zero(), "current thread is not attached to the runtime");
        unsafe { tls.add(offset).load::<ThreadId>() }
    }

    #[inline(always)]
    pub(crate) fn load_managed_thread(tls: Address, offset: usize) -> ObjectRef {
        assert!(!tls.is_zero(), "current thread is not attached to the runtime");
        let raw = unsafe { tls.add(offset).atomic_load::<AtomicUsize>(Ordering::Acquire) };
        ObjectRef::from_address(unsafe { Address::from_usize(raw) })
    }
}

thread_local! {
    static CURRENT_THREAD: Cell<Address> = const { Cell::new(Address::ZERO) };
}

/// Base of the calling thread's TLS block. Zero when the thread is not attached.
#[inline(always)]
pub fn tls_base_address() -> Address {
    CURRENT_THREAD.with(|t| t.get())
}

pub fn current_thread() -> &'static Thread {
    let addr = tls_base_address();

    assert!(!addr.is_zero(), "current thread is not attached to the runtime");
    unsafe { addr.as_ref() }
}

pub fn try_current_thread() -> Option<&'static Thread> {
    let addr = tls_base_address();

    if addr.is_zero() {
        None
    } else {
        Some(unsafe { addr.as_ref() })
    }
}

pub(crate) fn init_current_thread(thread: Arc<Thread>) {
    let thread = Arc::into_raw(thread);
    CURRENT_THREAD.with(|t| t.set(Address::from_ptr(thread)));
}

pub(crate) fn deinit_current_thread() {
    CURRENT_THREAD.with(|t| {
        let threadptr = t.replace(Address::ZERO);
        if !threadptr.is_zero() {
            let thread: Arc<Thread> = unsafe { Arc::from_raw(threadptr.to_ptr()) };
            drop(thread);
        }
    })
}

/// Execute `f` with the current thread marked as blocked.
///
/// Used around every operation that may park the OS thread. Unattached threads
/// simply run `f`.
pub fn parked_scope<R>(f: impl FnOnce() -> R) -> R {
    match try_current_thread() {
        Some(thread) => {
            let previous = thread.get_exec_status();
            thread.set_exec_status(ThreadState::Blocked);
            let result = f();
            thread.set_exec_status(previous);
            result
        }
        None => f(),
    }
}

static THREAD_MANAGER: LazyLock<ThreadManager> = LazyLock::new(ThreadManager::new);

pub fn thread_manager() -> &'static ThreadManager {
    &THREAD_MANAGER
}

/// Registry of live threads, indexed by thread id.
pub struct ThreadManager {
    inner: Monitor<RefCell<ThreadManagerInner>>,
}

struct ThreadManagerInner {
    /// Slot `i` belongs to thread id `i + 1`.
    threads: Vec<Option<Arc<Thread>>>,
    free_ids: Vec<ThreadId>,
}

impl ThreadManager {
    fn new() -> Self {
        Self {
            inner: Monitor::new(RefCell::new(ThreadManagerInner {
                threads: Vec::new(),
                free_ids: Vec::new(),
            })),
        }
    }

    fn reserve_id(&self) -> Result<ThreadId> {
        let inner = self.inner.lock();
        let mut inner = inner.borrow_mut();

        if let Some(id) = inner.free_ids.pop() {
            return Ok(id);
        }
        // The slot stays empty until `add_thread` fills it.
        let next = inner.threads.len() + 1;
        let id = ThreadId::from_usize(next)
            .filter(|_| next <= MAX_THREADS)
            .ok_or(Error::TooManyThreads { limit: MAX_THREADS })?;
        inner.threads.push(None);
        Ok(id)
    }

    fn add_thread(&self, thread: Arc<Thread>) {
        let inner = self.inner.lock();
        let mut inner = inner.borrow_mut();

        let index = thread.id().as_usize() - 1;
        debug_assert!(inner.threads[index].is_none());
        inner.threads[index] = Some(thread);
    }

    fn remove_thread(&self, id: ThreadId) {
        let inner = self.inner.lock();
        let mut inner = inner.borrow_mut();

        inner.threads[id.as_usize() - 1] = None;
        inner.free_ids.push(id);
    }

    /// Look up a live thread by id.
    pub fn get(&self, id: ThreadId) -> Option<Arc<Thread>> {
        let inner = self.inner.lock();
        let inner = inner.borrow();
        inner.threads.get(id.as_usize() - 1).cloned().flatten()
    }

    pub fn threads(&self) -> impl Iterator<Item = Arc<Thread>> {
        let inner = self.inner.lock();
        let threads = inner.borrow().threads.clone();
        threads.into_iter().flatten()
    }

    /// Number of registered threads. Terminated threads unregister themselves.
    pub fn live_count(&self) -> usize {
        self.threads().count()
    }

    /// Number of threads currently parked in a monitor.
    pub fn blocked_count(&self) -> usize {
        self.threads().filter(|t| t.is_blocked()).count()
    }
}
