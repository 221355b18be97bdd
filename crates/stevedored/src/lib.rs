//! # stevedored
//!
//! The Stevedore daemon. [`app`] wires configuration, runtime, stores, engine
//! and event monitor together; [`http`] serves the control channel and the
//! event push stream.

#![warn(missing_docs)]

pub mod app;
pub mod http;

pub use app::App;
