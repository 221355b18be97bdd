//! Composition root.

use std::sync::Arc;

use stevedore::hooks::{CommandHostsHelper, HostsHelper, RoutesFile};
use stevedore::{
    Catalog, ControlPlane, Engine, EventMonitor, HookRegistry, ProxySyncHook, RuntimeKind,
    StateView, StevedoreConfig, Stores,
};
use stevedore_common::{ResourceId, StevedorePaths, StevedoreResult};
use stevedore_runtime::{Bounded, ContainerRuntime, DockerCli, MemoryRuntime, Timeouts};
use tokio::task::JoinHandle;

/// Service whose install regenerates proxy routes.
const PROXY_SERVICE: &str = "caddy";

/// Everything the daemon runs, built from one [`StevedoreConfig`].
#[derive(Debug)]
pub struct App {
    config: StevedoreConfig,
    paths: StevedorePaths,
    control: ControlPlane,
    monitor: EventMonitor,
    view: StateView,
}

impl App {
    /// Build every component. Nothing is started.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory or the catalog override is
    /// unusable.
    pub fn build(config: StevedoreConfig) -> StevedoreResult<Self> {
        let paths = config.paths();
        let runtime = runtime(&config);
        let stores = Stores::open(&paths)?;
        let catalog = Catalog::load(config.catalog.as_deref())?;
        tracing::debug!(
            root = %paths.root.display(),
            runtime = runtime.name(),
            services = catalog.len(),
            "Building daemon"
        );

        let engine = Engine::new(Arc::clone(&runtime), catalog, stores)
            .with_network(config.network.clone())
            .with_hooks(hooks(&config, &paths)?);
        let monitor = EventMonitor::new(Arc::clone(&runtime), config.monitor.clone());
        let view = StateView::new(runtime);
        let control = ControlPlane::new(Arc::new(engine), monitor.clone());

        Ok(Self {
            config,
            paths,
            control,
            monitor,
            view,
        })
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &StevedoreConfig {
        &self.config
    }

    /// Filesystem layout in use.
    #[must_use]
    pub const fn paths(&self) -> &StevedorePaths {
        &self.paths
    }

    /// Control channel.
    #[must_use]
    pub const fn control(&self) -> &ControlPlane {
        &self.control
    }

    /// Cached runtime state.
    #[must_use]
    pub const fn view(&self) -> &StateView {
        &self.view
    }

    /// Reconcile persisted state with the runtime, then start watching
    /// events.
    ///
    /// An unreachable runtime is not fatal: the monitor keeps retrying and
    /// resynchronizes once it connects.
    pub async fn start(&self) -> JoinHandle<()> {
        let engine = self.control.engine();
        match engine.runtime().ping().await {
            Ok(()) => match engine.sync_installed().await {
                Ok(report) => tracing::info!(
                    checked = report.checked,
                    vanished = report.vanished.len(),
                    relinked = report.relinked.len(),
                    orphans = report.orphans.len(),
                    "Installed resources reconciled"
                ),
                Err(e) => tracing::warn!(error = %e, "Could not reconcile installed resources"),
            },
            Err(e) => tracing::warn!(error = %e, "Container runtime not reachable at startup"),
        }

        if let Err(e) = self.view.reconcile().await {
            tracing::debug!(error = %e, "Initial state view not loaded");
        }
        self.view.follow(self.monitor.subscribe())
    }

    /// Stop the monitor and cancel pending health waits.
    pub async fn shutdown(&self) {
        self.control.shutdown();
        self.monitor.stop().await;
        tracing::info!("Daemon stopped");
    }
}

fn runtime(config: &StevedoreConfig) -> Arc<dyn ContainerRuntime> {
    let timeouts = Timeouts::from(config.timeouts);
    match config.runtime {
        RuntimeKind::Docker => Arc::new(Bounded::with_timeouts(
            DockerCli::with_binary(&config.docker_binary),
            timeouts,
        )),
        RuntimeKind::Memory => Arc::new(Bounded::with_timeouts(MemoryRuntime::new(), timeouts)),
    }
}

fn hooks(config: &StevedoreConfig, paths: &StevedorePaths) -> StevedoreResult<HookRegistry> {
    let routes = Arc::new(RoutesFile::new(paths.generated().join("routes.json")));
    let hosts = config.hosts_helper.as_ref().map(|program| {
        tracing::debug!(helper = %program.display(), "Hosts helper configured");
        Arc::new(CommandHostsHelper::new(program)) as Arc<dyn HostsHelper>
    });

    let mut registry = HookRegistry::new();
    registry.register(
        ResourceId::new(PROXY_SERVICE)?,
        Arc::new(ProxySyncHook::new(routes, hosts)),
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_memory_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = StevedoreConfig::default()
            .with_root(dir.path())
            .with_runtime(RuntimeKind::Memory);

        let app = App::build(config).unwrap();
        assert!(app.paths().state_file("installed").exists());
        assert_eq!(app.control().engine().runtime().name(), "memory");
    }
}
