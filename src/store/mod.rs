//! Distributed key-value store
//!
//! Location-transparent storage for any serializable object: keys route
//! to a home node by a pure hash, reads go through a per-node cache, and
//! writes are versioned so `atomic_update` can commit optimistically.
//! Write locks are layered on top for structural mutation.

pub mod key;
pub mod kv;

pub(crate) mod lock;

pub use key::Key;
