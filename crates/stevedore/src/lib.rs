//! # Stevedore
//!
//! Installs, starts, stops and removes the containers behind a local
//! development environment: a catalog of infrastructure services plus the
//! user's own projects.
//!
//! ## Pieces
//!
//! - **Engine**: per-resource lifecycle with single-flight guards, rollback of
//!   half-finished installs and post-install hooks
//! - **Event monitor**: one long-lived runtime event subscription fanned out to
//!   any number of subscribers, with reconnect and resync
//! - **State view**: a runtime state cache kept current from monitor notices
//! - **Control plane**: the envelope-returning surface the daemon serves
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stevedore::{Catalog, Engine, InstallOptions, Stores};
//! use stevedore_common::{ResourceId, StevedorePaths};
//! use stevedore_runtime::{ContainerRuntime, MemoryRuntime};
//!
//! # async fn example() -> stevedore_common::StevedoreResult<()> {
//! let runtime: Arc<dyn ContainerRuntime> = Arc::new(MemoryRuntime::new());
//! let stores = Stores::open(&StevedorePaths::with_root("/tmp/stevedore"))?;
//! let engine = Engine::new(runtime, Catalog::builtin()?, stores);
//!
//! let redis = ResourceId::new("redis")?;
//! let outcome = engine.install(&redis, InstallOptions::default()).await?;
//! assert!(outcome.state.running);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod control;
pub mod engine;
pub mod health;
pub mod hooks;
pub mod inflight;
pub mod monitor;
pub mod progress;
pub mod state;
pub mod view;

pub use catalog::{Catalog, ResourceDefinition, RuntimeDefaults};
pub use config::{RuntimeKind, StevedoreConfig};
pub use control::{ApiError, ApiResponse, ControlPlane, InstallRequest, UninstallRequest};
pub use engine::{
    Engine, InstallOptions, InstallOutcome, ResourceStatus, ResourceSummary, SyncReport,
    UninstallOutcome,
};
pub use hooks::{HookRegistry, HookWarning, PostInstallHook, ProxySyncHook};
pub use monitor::{ConnectionStatus, ContainerEvent, EventMonitor, MonitorConfig, MonitorNotice, Subscription};
pub use progress::{InstallProgress, ProgressHub};
pub use state::{DesiredState, InstalledResource, PersistedResourceConfig, ProjectDefinition, Stores};
pub use view::StateView;
