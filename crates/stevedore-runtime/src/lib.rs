//! # stevedore-runtime
//!
//! The capability surface Stevedore needs from a container runtime.
//!
//! [`ContainerRuntime`] is the contract the engine and the event monitor are
//! written against. Two backends ship with it:
//! - [`DockerCli`] drives the `docker` command line
//! - [`MemoryRuntime`] simulates a runtime in-process for tests and demos
//!
//! [`Bounded`] wraps any backend so that queries never hang the caller when
//! the daemon is unreachable.

#![warn(missing_docs)]

mod bounded;
mod client;
mod docker;
mod memory;
mod types;

pub use bounded::{Bounded, Timeouts};
pub use client::{ContainerRuntime, EventStream, PullStream};
pub use docker::DockerCli;
pub use memory::{HealthBehavior, MemoryRuntime};
pub use types::{
    ContainerSpec, EventAction, HealthCheckSpec, HealthStatus, PortMapping, Protocol,
    PullProgress, RawEvent, RuntimeState, VolumeBinding,
};
