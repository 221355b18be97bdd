//! Control channel.
//!
//! [`ControlPlane`] is what a front end talks to. Every method answers with an
//! [`ApiResponse`]; failures are reported in the envelope, never as a Rust
//! error. Lifecycle operations run on their own tasks so that a caller going
//! away mid-request does not abort an install halfway through.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stevedore_common::{ResourceId, StevedoreError, StevedoreResult};
use stevedore_runtime::RuntimeState;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::catalog::ResourceDefinition;
use crate::engine::{Engine, InstallOptions, InstallOutcome, ResourceSummary, UninstallOutcome};
use crate::monitor::{ConnectionStatus, EventMonitor, Subscription};
use crate::progress::InstallProgress;
use crate::state::{PersistedResourceConfig, ProjectDefinition};

/// Error half of an [`ApiResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable code, see [`StevedoreError::api_code`].
    pub code: String,
    /// Human readable message.
    pub message: String,
}

impl From<&StevedoreError> for ApiError {
    fn from(err: &StevedoreError) -> Self {
        Self {
            code: err.api_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Envelope returned by every control operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Successful response.
    pub const fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response.
    pub fn err(err: &StevedoreError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.into()),
        }
    }

    /// Wrap an engine result.
    pub fn from_result(result: StevedoreResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(&e),
        }
    }

    /// The error code, if failed.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Optional install parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    /// Start the container after creating it.
    #[serde(default = "default_start")]
    pub start: bool,
    /// Override persisted before installing.
    #[serde(default)]
    pub config: Option<PersistedResourceConfig>,
}

const fn default_start() -> bool {
    true
}

impl Default for InstallRequest {
    fn default() -> Self {
        Self {
            start: true,
            config: None,
        }
    }
}

/// Optional uninstall parameters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallRequest {
    /// Also delete the resource's volumes.
    #[serde(default)]
    pub remove_volumes: bool,
}

/// Front-end facing operations over an [`Engine`] and an [`EventMonitor`].
#[derive(Debug, Clone)]
pub struct ControlPlane {
    engine: Arc<Engine>,
    monitor: EventMonitor,
    shutdown: CancellationToken,
}

impl ControlPlane {
    /// Wrap an engine and monitor.
    pub fn new(engine: Arc<Engine>, monitor: EventMonitor) -> Self {
        Self {
            engine,
            monitor,
            shutdown: CancellationToken::new(),
        }
    }

    /// The engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Cancel pending health waits of running installs.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Every resource with its status.
    pub async fn list_resources(&self) -> ApiResponse<Vec<ResourceSummary>> {
        respond("list_resources", self.engine.summaries().await)
    }

    /// One resource with its status.
    pub async fn get_resource(&self, id: &str) -> ApiResponse<ResourceSummary> {
        let result = match parse_id(id) {
            Ok(id) => self.engine.summary(&id).await,
            Err(e) => Err(e),
        };
        respond("get_resource", result)
    }

    /// Live runtime state.
    pub async fn get_runtime_state(&self, id: &str) -> ApiResponse<RuntimeState> {
        let result = match parse_id(id) {
            Ok(id) => self.engine.runtime_state(&id).await,
            Err(e) => Err(e),
        };
        respond("get_runtime_state", result)
    }

    /// Persisted override of a resource.
    pub fn get_config(&self, id: &str) -> ApiResponse<Option<PersistedResourceConfig>> {
        respond("get_config", parse_id(id).and_then(|id| self.engine.config(&id)))
    }

    /// Install a resource, persisting `request.config` once the install is accepted.
    pub async fn install(&self, id: &str, request: Option<InstallRequest>) -> ApiResponse<InstallOutcome> {
        let request = request.unwrap_or_default();
        let cancel = self.shutdown.child_token();
        let result = self
            .detached(id, move |engine, id| async move {
                let options = InstallOptions {
                    start: request.start,
                    cancel,
                    config: request.config,
                };
                engine.install(&id, options).await
            })
            .await;
        respond("install", result)
    }

    /// Uninstall a resource.
    pub async fn uninstall(&self, id: &str, remove_volumes: Option<bool>) -> ApiResponse<UninstallOutcome> {
        let remove_volumes = remove_volumes.unwrap_or(false);
        let result = self
            .detached(id, move |engine, id| async move {
                engine.uninstall(&id, remove_volumes).await
            })
            .await;
        respond("uninstall", result)
    }

    /// Start an installed resource.
    pub async fn start(&self, id: &str) -> ApiResponse<RuntimeState> {
        let result = self
            .detached(id, |engine, id| async move { engine.start(&id).await })
            .await;
        respond("start", result)
    }

    /// Stop an installed resource.
    pub async fn stop(&self, id: &str) -> ApiResponse<RuntimeState> {
        let result = self
            .detached(id, |engine, id| async move { engine.stop(&id).await })
            .await;
        respond("stop", result)
    }

    /// Restart an installed resource.
    pub async fn restart(&self, id: &str) -> ApiResponse<RuntimeState> {
        let result = self
            .detached(id, |engine, id| async move { engine.restart(&id).await })
            .await;
        respond("restart", result)
    }

    /// Persist a configuration override.
    pub fn update_config(
        &self,
        id: &str,
        config: PersistedResourceConfig,
    ) -> ApiResponse<PersistedResourceConfig> {
        respond(
            "update_config",
            parse_id(id).and_then(|id| self.engine.update_config(&id, config)),
        )
    }

    /// Declare a project.
    pub fn register_project(&self, project: ProjectDefinition) -> ApiResponse<ResourceDefinition> {
        respond("register_project", self.engine.register_project(project))
    }

    /// Forget a project.
    pub async fn remove_project(&self, id: &str) -> ApiResponse<ProjectDefinition> {
        let result = match parse_id(id) {
            Ok(id) => self.engine.remove_project(&id).await,
            Err(e) => Err(e),
        };
        respond("remove_project", result)
    }

    /// Event stream connection status.
    pub fn connection_status(&self) -> ApiResponse<ConnectionStatus> {
        ApiResponse::ok(self.monitor.status())
    }

    /// Subscribe to monitor notices.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.monitor.subscribe()
    }

    /// Subscribe to install progress.
    #[must_use]
    pub fn progress(&self) -> broadcast::Receiver<InstallProgress> {
        self.engine.progress().subscribe()
    }

    async fn detached<F, Fut, T>(&self, id: &str, operation: F) -> StevedoreResult<T>
    where
        F: FnOnce(Arc<Engine>, ResourceId) -> Fut,
        Fut: Future<Output = StevedoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let id = parse_id(id)?;
        let task = tokio::spawn(operation(Arc::clone(&self.engine), id));
        task.await.map_err(|e| StevedoreError::Internal {
            message: format!("lifecycle task failed: {e}"),
        })?
    }
}

fn parse_id(id: &str) -> StevedoreResult<ResourceId> {
    ResourceId::new(id)
}

fn respond<T>(operation: &str, result: StevedoreResult<T>) -> ApiResponse<T> {
    if let Err(e) = &result {
        tracing::debug!(operation, code = e.api_code(), error = %e, "Control operation failed");
    }
    ApiResponse::from_result(result)
}
