use thiserror::Error;

use crate::{object_model::object::ObjectRef, threading::ThreadId};

/// Errors reported by the parts of the runtime that can fail.
///
/// `enter` and `exit` on an object monitor never return an error: a lost CAS
/// race is ordinary control flow, and unbalanced exits are the caller's
/// responsibility. Errors only surface from the `wait`/`notify` family, thread
/// registration and object allocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The calling thread tried to wait on or notify an object whose monitor
    /// it does not own.
    #[error("thread {thread} does not own the monitor of {object}")]
    IllegalMonitorState { thread: ThreadId, object: ObjectRef },

    /// Every thread id representable in a lock word is taken by a live thread.
    #[error("cannot register more than {limit} threads")]
    TooManyThreads { limit: usize },

    /// The object arena has no room left for the requested allocation.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
