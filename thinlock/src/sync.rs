//! Object monitors.
//!
//! Locking an object normally touches nothing but its lock word: see
//! [`thin::ThinLocks`]. Contended locks, locks nested too deeply and locks that
//! are waited on move to a [`fat::FatMonitor`], which parks threads on a
//! [`Monitor`].
pub mod fat;
pub mod lock_word;
pub mod monitor;
pub mod thin;

pub use fat::{FatMonitor, InflatedMonitor, InflatedMonitors};
pub use lock_word::{LockState, LockWord};
pub use monitor::*;
pub use thin::{ObjectMonitorGuard, ThinLocks};

pub use super::threading::parked_scope;
