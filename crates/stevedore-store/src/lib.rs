//! # stevedore-store
//!
//! Durable, crash-safe persistence for Stevedore's declarative state.
//!
//! Each [`JsonStore`] owns one entity kind and one JSON file holding an
//! [`Envelope`]: `{items: {id: T}, version, lastUpdated}`. Every mutation is
//! written synchronously through a temp-file-then-rename sequence, so a
//! reader never sees a half-written envelope and a crash mid-write leaves the
//! previous one intact. A file that fails to decode is moved aside and
//! replaced with an empty envelope instead of failing the caller.

#![warn(missing_docs)]

mod atomic;
mod envelope;
mod store;

pub use atomic::write_atomic;
pub use envelope::{Envelope, SCHEMA_VERSION};
pub use store::JsonStore;
