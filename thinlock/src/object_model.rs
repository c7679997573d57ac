//! Object layout seen by the lock core: a fixed header holding the lock word in
//! front of every object, and a bump arena to allocate objects from.
pub mod header;
pub mod heap;
pub mod object;
