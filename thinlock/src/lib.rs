//! Thin object locks with a fat monitor fallback.
//!
//! Objects live in a [`Heap`](object_model::heap::Heap) and carry a lock word in
//! their header. Threads attach through [`Thread`](threading::Thread), which
//! gives each of them a small id that fits in that word.
//! [`ThinLocks`](sync::ThinLocks) implements monitor enter and exit on top.

pub mod address;
pub mod error;
pub mod layout;
pub mod logger;
pub mod object_model;
pub mod options;
pub mod sync;
pub mod threading;

pub use error::{Error, Result};

pub mod prelude {
    pub use super::address::{Address, LockWordSlot};
    pub use super::error::{Error, Result};
    pub use super::layout::RuntimeLayout;
    pub use super::object_model::{heap::Heap, object::ObjectRef};
    pub use super::sync::{
        FatMonitor, InflatedMonitors, LockState, LockWord, Monitor, ObjectMonitorGuard, ThinLocks,
    };
    pub use super::threading::{Thread, ThreadId, ThreadIdentity};
}
