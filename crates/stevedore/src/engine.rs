//! Resource lifecycle engine.
//!
//! Every transition follows the same shape: claim the resource, check the
//! persisted record against what the runtime reports, drive the runtime,
//! then persist the outcome. Per resource the states are:
//!
//! ```text
//! NotInstalled ─install─▶ Installing ─▶ Stopped ⇄ Running{health}
//!       ▲                                  │
//!       └────────── Uninstalling ◀─uninstall┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use stevedore_common::{LabelOrigin, ResourceId, StevedoreError, StevedoreResult, labels};
use stevedore_runtime::{ContainerRuntime, ContainerSpec, HealthStatus, RuntimeState};
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, ResourceDefinition};
use crate::health::wait_until_healthy;
use crate::hooks::{HookContext, HookRegistry, HookWarning};
use crate::inflight::{InFlight, Operation};
use crate::progress::ProgressHub;
use crate::state::{DesiredState, InstalledResource, PersistedResourceConfig, ProjectDefinition, Stores};

/// Install knobs.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Start the container once created.
    pub start: bool,
    /// Checked before every health check attempt.
    pub cancel: CancellationToken,
    /// Override persisted once the resource is known not to be installed.
    pub config: Option<PersistedResourceConfig>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            start: true,
            cancel: CancellationToken::new(),
            config: None,
        }
    }
}

/// Result of a successful install.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    /// The persisted record.
    pub resource: InstalledResource,
    /// Runtime state at the end of the install.
    pub state: RuntimeState,
    /// Post-install hook failures.
    #[serde(default)]
    pub warnings: Vec<HookWarning>,
}

/// Result of an uninstall.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallOutcome {
    /// Whether a container was removed.
    pub container_removed: bool,
    /// Volumes that were removed.
    pub removed_volumes: Vec<String>,
}

/// Where a resource is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResourceStatus {
    /// No record and no container.
    NotInstalled,
    /// Install in progress.
    Installing,
    /// Uninstall in progress.
    Uninstalling,
    /// Installed, container stopped.
    Stopped,
    /// Installed, container running.
    Running {
        /// Reported health.
        health: HealthStatus,
    },
    /// Installed, but the container is gone.
    Missing,
    /// The runtime could not be asked.
    Unknown,
}

impl ResourceStatus {
    fn derive(operation: Option<Operation>, installed: bool, state: Option<&RuntimeState>) -> Self {
        match (operation, state) {
            (Some(Operation::Install), _) => Self::Installing,
            (Some(Operation::Uninstall), _) => Self::Uninstalling,
            (_, None) => Self::Unknown,
            (_, Some(state)) if state.exists && state.running => Self::Running {
                health: state.health,
            },
            (_, Some(state)) if state.exists => Self::Stopped,
            (_, Some(_)) if installed => Self::Missing,
            (_, Some(_)) => Self::NotInstalled,
        }
    }
}

/// A definition with its current status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    /// Definition.
    pub definition: ResourceDefinition,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Persisted record, if installed.
    pub installed: Option<InstalledResource>,
}

/// What [`Engine::sync_installed`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Records checked.
    pub checked: usize,
    /// Records whose container disappeared.
    pub vanished: Vec<ResourceId>,
    /// Records pointing at a recreated container.
    pub relinked: Vec<ResourceId>,
    /// Managed containers without a record.
    pub orphans: Vec<ResourceId>,
}

/// Drives resource lifecycles against a container runtime.
pub struct Engine {
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Catalog,
    stores: Stores,
    hooks: HookRegistry,
    inflight: InFlight,
    progress: ProgressHub,
    network: String,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("runtime", &self.runtime.name())
            .field("services", &self.catalog.len())
            .field("hooks", &self.hooks)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// New engine on the default `stevedore` network.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, catalog: Catalog, stores: Stores) -> Self {
        Self {
            runtime,
            catalog,
            stores,
            hooks: HookRegistry::new(),
            inflight: InFlight::new(),
            progress: ProgressHub::new(),
            network: "stevedore".to_string(),
        }
    }

    /// Use another shared network.
    #[must_use]
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Use these post-install hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Publish pull progress on `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressHub) -> Self {
        self.progress = progress;
        self
    }

    /// Install progress hub.
    #[must_use]
    pub const fn progress(&self) -> &ProgressHub {
        &self.progress
    }

    /// The runtime in use.
    #[must_use]
    pub const fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// The persisted stores.
    #[must_use]
    pub const fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Definition of a service or project.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotFound`] for unknown ids.
    pub fn definition(&self, id: &ResourceId) -> StevedoreResult<ResourceDefinition> {
        if let Some(service) = self.catalog.get(id) {
            return Ok(service.clone());
        }
        self.stores
            .projects
            .get(id.as_str())?
            .map(|p| p.to_definition())
            .ok_or_else(|| StevedoreError::NotFound {
                kind: "Resource",
                id: id.to_string(),
            })
    }

    /// All services followed by all projects.
    ///
    /// # Errors
    ///
    /// Fails only if the project store is unusable.
    pub fn list(&self) -> StevedoreResult<Vec<ResourceDefinition>> {
        let mut all: Vec<_> = self.catalog.iter().cloned().collect();
        all.extend(
            self.stores
                .projects
                .get_all()?
                .values()
                .map(ProjectDefinition::to_definition),
        );
        Ok(all)
    }

    /// Every resource with its status, from a single runtime listing.
    ///
    /// When the runtime is unreachable statuses are [`ResourceStatus::Unknown`].
    ///
    /// # Errors
    ///
    /// Fails only if a store is unusable.
    pub async fn summaries(&self) -> StevedoreResult<Vec<ResourceSummary>> {
        let states = match self.managed_containers().await {
            Ok(states) => Some(states),
            Err(e) if e.is_unavailable() => {
                tracing::warn!(error = %e, "Runtime unavailable, statuses unknown");
                None
            }
            Err(e) => return Err(e),
        };
        let installed = self.stores.installed.get_all()?;

        Ok(self
            .list()?
            .into_iter()
            .map(|definition| {
                let record = installed.get(definition.id.as_str()).cloned();
                let state = states
                    .as_ref()
                    .map(|s| s.get(&definition.id).cloned().unwrap_or_default());
                let status = ResourceStatus::derive(
                    self.inflight.current(&definition.id),
                    record.is_some(),
                    state.as_ref(),
                );
                ResourceSummary {
                    definition,
                    status,
                    installed: record,
                }
            })
            .collect())
    }

    /// One resource with its status.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotFound`] for unknown ids, or the runtime
    /// error.
    pub async fn summary(&self, id: &ResourceId) -> StevedoreResult<ResourceSummary> {
        let definition = self.definition(id)?;
        let status = self.status(id).await?;
        Ok(ResourceSummary {
            definition,
            status,
            installed: self.stores.installed.get(id.as_str())?,
        })
    }

    /// Live runtime state of a resource's container.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotFound`] for unknown ids, or the runtime
    /// error.
    pub async fn runtime_state(&self, id: &ResourceId) -> StevedoreResult<RuntimeState> {
        let definition = self.definition(id)?;
        self.locate(&definition).await
    }

    /// Lifecycle status of a resource.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::NotFound`] for unknown ids, or the runtime
    /// error.
    pub async fn status(&self, id: &ResourceId) -> StevedoreResult<ResourceStatus> {
        let definition = self.definition(id)?;
        let operation = self.inflight.current(id);
        if matches!(operation, Some(Operation::Install | Operation::Uninstall)) {
            return Ok(ResourceStatus::derive(operation, false, None));
        }
        let installed = self.stores.installed.has(id.as_str())?;
        let state = self.locate(&definition).await?;
        Ok(ResourceStatus::derive(operation, installed, Some(&state)))
    }

    /// Persisted override for a resource.
    ///
    /// # Errors
    ///
    /// Fails only if the store is unusable.
    pub fn config(&self, id: &ResourceId) -> StevedoreResult<Option<PersistedResourceConfig>> {
        self.stores.configs.get(id.as_str())
    }

    /// Install a resource.
    ///
    /// Ensures the shared network, creates the declared volumes, pulls the
    /// image (publishing progress), creates the container from the defaults
    /// merged with the persisted override and, unless told otherwise, starts
    /// it and waits for its health check. A failure after the container was
    /// created removes the container again; volumes are kept. The post-install
    /// hook runs last and can only add warnings.
    ///
    /// # Errors
    ///
    /// - [`StevedoreError::AlreadyInstalled`] if a record or a labelled
    ///   container exists
    /// - [`StevedoreError::OperationInProgress`] if the resource is busy
    /// - [`StevedoreError::HealthCheckTimeout`], [`StevedoreError::Cancelled`]
    /// - any runtime or store error
    pub async fn install(
        &self,
        id: &ResourceId,
        options: InstallOptions,
    ) -> StevedoreResult<InstallOutcome> {
        let definition = self.definition(id)?;
        let _guard = self.inflight.acquire(id, Operation::Install)?;
        tracing::info!(resource = %id, image = %definition.defaults.image, "Installing resource");

        if self.stores.installed.has(id.as_str())? || self.locate(&definition).await?.exists {
            return Err(StevedoreError::AlreadyInstalled { id: id.to_string() });
        }
        if let Some(config) = &options.config {
            config.validate(&definition)?;
            self.stores.configs.set(id.as_str(), config.clone())?;
            tracing::debug!(resource = %id, "Install override saved");
        }

        self.runtime
            .ensure_network(&self.network, &labels::shared())
            .await?;
        let resource_labels = definition.labels();
        for volume in &definition.defaults.volumes {
            let name = definition.volume_name(volume);
            tracing::debug!(resource = %id, volume = %name, "Creating volume");
            self.runtime.create_volume(&name, &resource_labels).await?;
        }

        let custom = self.stores.configs.get(id.as_str())?;
        let spec = definition.container_spec(custom.as_ref(), &self.network);
        self.pull(id, &spec.image).await?;

        if options.cancel.is_cancelled() {
            return Err(StevedoreError::Cancelled { id: id.to_string() });
        }

        let container_id = self.runtime.create_container(&spec).await?;
        tracing::debug!(resource = %id, container = %container_id, "Container created");

        let (resource, state) = match self
            .finish_install(&definition, &spec, &container_id, &options)
            .await
        {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(resource = %id, error = %e, "Install failed, removing container");
                if let Err(cleanup) = self.runtime.remove(&container_id).await {
                    tracing::error!(resource = %id, error = %cleanup, "Could not remove container after failed install");
                }
                return Err(e);
            }
        };

        let mut warnings = Vec::new();
        if let Some(hook) = self.hooks.get(id) {
            let ctx = HookContext {
                definition: &definition,
                container_id: &container_id,
                state: &state,
                projects: &self.stores.projects,
            };
            match hook.run(&ctx).await {
                Ok(()) => tracing::debug!(resource = %id, hook = hook.name(), "Post-install hook done"),
                Err(e) => {
                    tracing::warn!(resource = %id, hook = hook.name(), error = %e, "Post-install hook failed");
                    warnings.push(HookWarning::from_error(hook.name(), &e));
                }
            }
        }

        tracing::info!(resource = %id, running = state.running, health = %state.health, "Resource installed");
        Ok(InstallOutcome {
            resource,
            state,
            warnings,
        })
    }

    async fn pull(&self, id: &ResourceId, image: &str) -> StevedoreResult<()> {
        tracing::info!(resource = %id, image, "Pulling image");
        let mut stream = self.runtime.pull_image(image).await?;
        let mut tracker = self.progress.tracker(id.clone());
        while let Some(update) = stream.next().await {
            tracker.record(&update?);
        }
        if let Some(last) = tracker.last() {
            tracing::debug!(resource = %id, bytes = last.bytes_total, "Pull complete");
        }
        Ok(())
    }

    async fn finish_install(
        &self,
        definition: &ResourceDefinition,
        spec: &ContainerSpec,
        container_id: &str,
        options: &InstallOptions,
    ) -> StevedoreResult<(InstalledResource, RuntimeState)> {
        if options.start {
            self.runtime.start(container_id).await?;
            if let Some(check) = &spec.healthcheck {
                wait_until_healthy(
                    self.runtime.as_ref(),
                    &definition.id,
                    container_id,
                    check,
                    &options.cancel,
                )
                .await?;
            }
        }

        let state = self.runtime.inspect(container_id).await?;
        let now = Utc::now();
        let resource = InstalledResource {
            id: definition.id.clone(),
            kind: definition.kind,
            container_id: Some(container_id.to_string()),
            container_name: spec.name.clone(),
            image: spec.image.clone(),
            volumes: definition.volume_names(),
            desired: if options.start {
                DesiredState::Running
            } else {
                DesiredState::Stopped
            },
            installed_at: now,
            last_transition: now,
        };
        self.stores
            .installed
            .set(definition.id.as_str(), resource.clone())?;
        Ok((resource, state))
    }

    /// Start an installed resource. Does not wait for health.
    ///
    /// # Errors
    ///
    /// [`StevedoreError::NotInstalled`], [`StevedoreError::OperationInProgress`]
    /// or the runtime error.
    pub async fn start(&self, id: &ResourceId) -> StevedoreResult<RuntimeState> {
        self.transition(id, Operation::Start).await
    }

    /// Stop an installed resource.
    ///
    /// # Errors
    ///
    /// As for [`start`](Self::start).
    pub async fn stop(&self, id: &ResourceId) -> StevedoreResult<RuntimeState> {
        self.transition(id, Operation::Stop).await
    }

    /// Restart an installed resource.
    ///
    /// # Errors
    ///
    /// As for [`start`](Self::start).
    pub async fn restart(&self, id: &ResourceId) -> StevedoreResult<RuntimeState> {
        self.transition(id, Operation::Restart).await
    }

    async fn transition(&self, id: &ResourceId, operation: Operation) -> StevedoreResult<RuntimeState> {
        let definition = self.definition(id)?;
        let _guard = self.inflight.acquire(id, operation)?;
        if !self.stores.installed.has(id.as_str())? {
            return Err(StevedoreError::NotInstalled { id: id.to_string() });
        }

        let current = self.locate(&definition).await?;
        let container = current
            .container_id
            .filter(|_| current.exists)
            .ok_or_else(|| StevedoreError::NotFound {
                kind: "Container",
                id: id.container_name(),
            })?;

        tracing::info!(resource = %id, %operation, "Lifecycle transition");
        let desired = match operation {
            Operation::Start => {
                self.runtime.start(&container).await?;
                DesiredState::Running
            }
            Operation::Stop => {
                self.runtime.stop(&container).await?;
                DesiredState::Stopped
            }
            Operation::Restart => {
                self.runtime.restart(&container).await?;
                DesiredState::Running
            }
            other => {
                return Err(StevedoreError::Internal {
                    message: format!("{other} is not a run state transition"),
                });
            }
        };

        let linked = container.clone();
        self.stores.installed.modify(id.as_str(), |record| {
            record.desired = desired;
            record.container_id = Some(linked);
            record.last_transition = Utc::now();
        })?;
        self.runtime.inspect(&container).await
    }

    /// Remove a resource's container and records.
    ///
    /// The container is stopped first if running. Declared volumes survive
    /// unless `remove_volumes` is set; the persisted override is always
    /// cleared.
    ///
    /// # Errors
    ///
    /// [`StevedoreError::NotInstalled`], [`StevedoreError::OperationInProgress`]
    /// or the runtime error.
    pub async fn uninstall(
        &self,
        id: &ResourceId,
        remove_volumes: bool,
    ) -> StevedoreResult<UninstallOutcome> {
        let definition = self.definition(id)?;
        let _guard = self.inflight.acquire(id, Operation::Uninstall)?;
        let record = self.stores.installed.get(id.as_str())?;
        let state = self.locate(&definition).await?;
        if record.is_none() && !state.exists {
            return Err(StevedoreError::NotInstalled { id: id.to_string() });
        }

        tracing::info!(resource = %id, remove_volumes, "Uninstalling resource");
        let mut outcome = UninstallOutcome::default();
        if let Some(container) = state.container_id.as_deref().filter(|_| state.exists) {
            if state.running {
                self.runtime.stop(container).await?;
            }
            self.runtime.remove(container).await?;
            outcome.container_removed = true;
        }

        if remove_volumes {
            let mut volumes: BTreeSet<String> = definition.volume_names().into_iter().collect();
            if let Some(record) = &record {
                volumes.extend(record.volumes.iter().cloned());
            }
            for volume in volumes {
                match self.runtime.remove_volume(&volume).await {
                    Ok(()) => outcome.removed_volumes.push(volume),
                    Err(StevedoreError::NotFound { .. }) => {}
                    Err(e) => tracing::warn!(resource = %id, volume = %volume, error = %e, "Volume not removed"),
                }
            }
        }

        self.stores.installed.delete(id.as_str())?;
        self.stores.configs.delete(id.as_str())?;
        tracing::info!(resource = %id, "Resource uninstalled");
        Ok(outcome)
    }

    /// Validate and persist a configuration override.
    ///
    /// Takes effect on the next install; an existing container is never
    /// recreated.
    ///
    /// # Errors
    ///
    /// [`StevedoreError::Validation`] for unusable overrides,
    /// [`StevedoreError::OperationInProgress`] if the resource is busy.
    pub fn update_config(
        &self,
        id: &ResourceId,
        config: PersistedResourceConfig,
    ) -> StevedoreResult<PersistedResourceConfig> {
        let definition = self.definition(id)?;
        let _guard = self.inflight.acquire(id, Operation::UpdateConfig)?;
        config.validate(&definition)?;
        self.stores.configs.set(id.as_str(), config.clone())?;
        tracing::info!(resource = %id, "Configuration updated");
        Ok(config)
    }

    /// Declare or redeclare a project.
    ///
    /// # Errors
    ///
    /// [`StevedoreError::Validation`] if the declaration is unusable or its
    /// id belongs to a service.
    pub fn register_project(&self, project: ProjectDefinition) -> StevedoreResult<ResourceDefinition> {
        project.validate()?;
        if self.catalog.contains(&project.id) {
            return Err(StevedoreError::validation(format!(
                "{} is a built-in service id",
                project.id
            )));
        }
        let definition = project.to_definition();
        let key = project.id.to_string();
        self.stores.projects.set(&key, project)?;
        tracing::info!(project = %definition.id, "Project registered");
        Ok(definition)
    }

    /// Forget a project.
    ///
    /// # Errors
    ///
    /// [`StevedoreError::NotFound`] for unknown projects,
    /// [`StevedoreError::Validation`] while it is installed or busy.
    ///
    /// Hooks of installed resources are told about the removal; their
    /// failures are logged and do not undo it.
    pub async fn remove_project(&self, id: &ResourceId) -> StevedoreResult<ProjectDefinition> {
        if !self.stores.projects.has(id.as_str())? {
            return Err(StevedoreError::NotFound {
                kind: "Project",
                id: id.to_string(),
            });
        }
        if self.stores.installed.has(id.as_str())? || self.inflight.current(id).is_some() {
            return Err(StevedoreError::validation(format!(
                "project {id} is installed; uninstall it first"
            )));
        }
        let removed = self
            .stores
            .projects
            .delete(id.as_str())?
            .ok_or_else(|| StevedoreError::NotFound {
                kind: "Project",
                id: id.to_string(),
            })?;
        tracing::info!(project = %id, "Project removed");

        for (trigger, hook) in self.hooks.iter() {
            if !self.stores.installed.has(trigger.as_str())? {
                continue;
            }
            if let Err(e) = hook.project_removed(&removed, &self.stores.projects).await {
                tracing::warn!(project = %id, hook = hook.name(), error = %e, "Hook could not drop removed project");
            }
        }
        Ok(removed)
    }

    /// Reconcile installed records with the containers that actually exist.
    ///
    /// Run at startup: records whose container vanished lose their container
    /// id, records pointing at a stale id are relinked to the labelled
    /// container, and labelled containers without a record are reported.
    ///
    /// # Errors
    ///
    /// The runtime or store error.
    pub async fn sync_installed(&self) -> StevedoreResult<SyncReport> {
        let records = self.stores.installed.get_all()?;
        let containers = self.managed_containers().await?;
        let mut report = SyncReport {
            checked: records.len(),
            ..SyncReport::default()
        };

        for (key, record) in &records {
            match containers.get(&record.id) {
                Some(state) if state.container_id != record.container_id => {
                    let container_id = state.container_id.clone();
                    self.stores
                        .installed
                        .modify(key, |r| r.container_id = container_id)?;
                    tracing::info!(resource = %record.id, "Relinked record to existing container");
                    report.relinked.push(record.id.clone());
                }
                Some(_) => {}
                None if record.container_id.is_some() => {
                    self.stores.installed.modify(key, |r| r.container_id = None)?;
                    tracing::warn!(resource = %record.id, "Container of installed resource vanished");
                    report.vanished.push(record.id.clone());
                }
                None => {}
            }
        }

        for id in containers.keys() {
            if !records.contains_key(id.as_str()) {
                tracing::info!(resource = %id, "Managed container has no install record");
                report.orphans.push(id.clone());
            }
        }
        Ok(report)
    }

    async fn managed_containers(&self) -> StevedoreResult<BTreeMap<ResourceId, RuntimeState>> {
        Ok(self
            .runtime
            .list(&labels::shared())
            .await?
            .into_iter()
            .filter_map(|state| LabelOrigin::from_labels(&state.labels).map(|o| (o.id, state)))
            .collect())
    }

    /// Find a resource's container: the recorded id first, then by label.
    async fn locate(&self, definition: &ResourceDefinition) -> StevedoreResult<RuntimeState> {
        if let Some(container) = self
            .stores
            .installed
            .get(definition.id.as_str())?
            .and_then(|r| r.container_id)
        {
            let state = self.runtime.inspect(&container).await?;
            if state.exists {
                return Ok(state);
            }
        }

        let key = labels::id_key(definition.kind);
        Ok(self
            .runtime
            .find_by_label(&key, definition.id.as_str(), definition.kind)
            .await?
            .unwrap_or_default())
    }
}
