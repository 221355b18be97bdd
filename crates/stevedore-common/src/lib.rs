//! # stevedore-common
//!
//! Shared types for the Stevedore orchestration engine.
//!
//! This crate provides the pieces every other Stevedore crate agrees on:
//! - Resource identifiers and kinds
//! - The label namespace used to claim runtime objects
//! - Standard filesystem paths
//! - Duration normalization for health check settings
//! - The common error type

#![warn(missing_docs)]

pub mod duration;
pub mod error;
pub mod id;
pub mod labels;
pub mod paths;

pub use error::{StevedoreError, StevedoreResult};
pub use id::{Category, ResourceId, ResourceKind};
pub use labels::{LabelOrigin, Labels};
pub use paths::StevedorePaths;
