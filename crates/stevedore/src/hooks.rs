//! Post-install hooks.
//!
//! A hook runs after a resource installs successfully and configures things
//! outside the container. Hook failures never undo the install: the engine
//! reports them as [`HookWarning`]s on the install result.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stevedore_common::{ResourceId, StevedoreError, StevedoreResult};
use stevedore_runtime::RuntimeState;
use stevedore_store::JsonStore;
use tokio::process::Command;

use crate::catalog::ResourceDefinition;
use crate::state::ProjectDefinition;

/// What a hook gets to work with.
#[derive(Debug)]
pub struct HookContext<'a> {
    /// The installed resource.
    pub definition: &'a ResourceDefinition,
    /// Its container.
    pub container_id: &'a str,
    /// Runtime state observed at the end of the install.
    pub state: &'a RuntimeState,
    /// Project declarations.
    pub projects: &'a JsonStore<ProjectDefinition>,
}

/// Work to do after a resource installs.
#[async_trait]
pub trait PostInstallHook: Send + Sync {
    /// Name used in logs and warnings.
    fn name(&self) -> &str;

    /// Run the hook.
    async fn run(&self, ctx: &HookContext<'_>) -> StevedoreResult<()>;

    /// Called once `project` has been deleted from `projects` while the
    /// hook's resource is installed.
    async fn project_removed(
        &self,
        _project: &ProjectDefinition,
        _projects: &JsonStore<ProjectDefinition>,
    ) -> StevedoreResult<()> {
        Ok(())
    }
}

/// A hook failure attached to an otherwise successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookWarning {
    /// Hook name.
    pub hook: String,
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

impl HookWarning {
    /// Build from the hook's error.
    #[must_use]
    pub fn from_error(hook: &str, err: &StevedoreError) -> Self {
        Self {
            hook: hook.to_string(),
            code: err.api_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Hooks keyed by the resource that triggers them.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<ResourceId, Arc<dyn PostInstallHook>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.hooks.iter().map(|(id, hook)| (id, hook.name())))
            .finish()
    }
}

impl HookRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` after `id` installs, replacing any previous hook.
    pub fn register(&mut self, id: ResourceId, hook: Arc<dyn PostInstallHook>) {
        tracing::debug!(resource = %id, hook = hook.name(), "Registered post-install hook");
        self.hooks.insert(id, hook);
    }

    /// The hook for `id`, if any.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<Arc<dyn PostInstallHook>> {
        self.hooks.get(id).cloned()
    }

    /// Registered hooks with the resource that triggers each.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &Arc<dyn PostInstallHook>)> {
        self.hooks.iter()
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hook is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// A domain the reverse proxy should serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    /// Project behind the domain.
    pub project: ResourceId,
    /// Domain name.
    pub domain: String,
    /// `host:port` reachable on the shared network.
    pub upstream: String,
}

/// Writes reverse-proxy routes.
#[async_trait]
pub trait ProxyConfigurator: Send + Sync {
    /// Replace the current routes with `routes`.
    async fn apply_routes(&self, routes: &[ProxyRoute]) -> StevedoreResult<()>;
}

/// Hands routes to the proxy configuration generator through a JSON file.
#[derive(Debug, Clone)]
pub struct RoutesFile {
    path: PathBuf,
}

impl RoutesFile {
    /// Write routes to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProxyConfigurator for RoutesFile {
    async fn apply_routes(&self, routes: &[ProxyRoute]) -> StevedoreResult<()> {
        let json = serde_json::to_vec_pretty(routes)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        stevedore_store::write_atomic(&self.path, &json)?;
        tracing::info!(path = %self.path.display(), routes = routes.len(), "Wrote proxy routes");
        Ok(())
    }
}

/// Hosts file edit requested from the privileged helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostsOperation {
    /// Add an entry.
    Add,
    /// Remove an entry.
    Remove,
}

impl fmt::Display for HostsOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Remove => "remove",
        })
    }
}

/// Privileged helper editing the OS hosts file.
#[async_trait]
pub trait HostsHelper: Send + Sync {
    /// Add or remove `ip domain`.
    ///
    /// Returns [`StevedoreError::PermissionDenied`] when the user declines
    /// elevation.
    async fn apply(&self, operation: HostsOperation, ip: IpAddr, domain: &str) -> StevedoreResult<()>;
}

/// Runs an external helper as `<program> [args..] <add|remove> <ip> <domain>`.
#[derive(Debug, Clone)]
pub struct CommandHostsHelper {
    program: PathBuf,
    args: Vec<String>,
}

/// Exit status of a helper whose elevation prompt was dismissed.
const EXIT_DECLINED: i32 = 126;

impl CommandHostsHelper {
    /// Helper at `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the operation (e.g. when `program` is an
    /// elevation wrapper).
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl HostsHelper for CommandHostsHelper {
    async fn apply(&self, operation: HostsOperation, ip: IpAddr, domain: &str) -> StevedoreResult<()> {
        tracing::debug!(program = %self.program.display(), %operation, %ip, domain, "Invoking hosts helper");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(operation.to_string())
            .arg(ip.to_string())
            .arg(domain)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.code() == Some(EXIT_DECLINED) || stderr.to_ascii_lowercase().contains("cancel") {
            return Err(StevedoreError::PermissionDenied {
                operation: format!("hosts {operation} {domain}"),
            });
        }
        Err(StevedoreError::HookFailed {
            id: domain.to_string(),
            message: format!("hosts helper exited with {}: {stderr}", output.status),
        })
    }
}

/// Keeps proxy routes and hosts entries in line with project domains.
///
/// Registered for the reverse proxy service.
pub struct ProxySyncHook {
    configurator: Arc<dyn ProxyConfigurator>,
    hosts: Option<Arc<dyn HostsHelper>>,
}

impl ProxySyncHook {
    /// New hook. Without a hosts helper only routes are written.
    pub fn new(configurator: Arc<dyn ProxyConfigurator>, hosts: Option<Arc<dyn HostsHelper>>) -> Self {
        Self { configurator, hosts }
    }

    fn routes(projects: &JsonStore<ProjectDefinition>) -> StevedoreResult<Vec<ProxyRoute>> {
        Ok(projects
            .get_all()?
            .into_values()
            .filter_map(|project| {
                let domain = project.domain?;
                Some(ProxyRoute {
                    upstream: format!("{}:{}", project.id.container_name(), project.port),
                    project: project.id,
                    domain,
                })
            })
            .collect())
    }
}

#[async_trait]
impl PostInstallHook for ProxySyncHook {
    fn name(&self) -> &str {
        "proxy-sync"
    }

    async fn run(&self, ctx: &HookContext<'_>) -> StevedoreResult<()> {
        let routes = Self::routes(ctx.projects)?;
        self.configurator.apply_routes(&routes).await?;

        let Some(hosts) = &self.hosts else {
            return Ok(());
        };

        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut failed = Vec::new();
        for route in &routes {
            match hosts.apply(HostsOperation::Add, loopback, &route.domain).await {
                Ok(()) => {}
                // Declined once means declined for the batch.
                Err(e @ StevedoreError::PermissionDenied { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(domain = %route.domain, error = %e, "Hosts entry not added");
                    failed.push(route.domain.clone());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(StevedoreError::HookFailed {
                id: ctx.definition.id.to_string(),
                message: format!("hosts entries not added for {}", failed.join(", ")),
            })
        }
    }

    async fn project_removed(
        &self,
        project: &ProjectDefinition,
        projects: &JsonStore<ProjectDefinition>,
    ) -> StevedoreResult<()> {
        let Some(domain) = &project.domain else {
            return Ok(());
        };
        let routes = Self::routes(projects)?;
        self.configurator.apply_routes(&routes).await?;

        if let Some(hosts) = &self.hosts {
            hosts
                .apply(HostsOperation::Remove, IpAddr::V4(Ipv4Addr::LOCALHOST), domain)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Recorder {
        routes: Mutex<Vec<ProxyRoute>>,
        hosts: Mutex<Vec<String>>,
        decline: bool,
    }

    #[async_trait]
    impl ProxyConfigurator for Recorder {
        async fn apply_routes(&self, routes: &[ProxyRoute]) -> StevedoreResult<()> {
            *self.routes.lock() = routes.to_vec();
            Ok(())
        }
    }

    #[async_trait]
    impl HostsHelper for Recorder {
        async fn apply(&self, operation: HostsOperation, ip: IpAddr, domain: &str) -> StevedoreResult<()> {
            if self.decline {
                return Err(StevedoreError::PermissionDenied {
                    operation: operation.to_string(),
                });
            }
            self.hosts.lock().push(format!("{operation} {ip} {domain}"));
            Ok(())
        }
    }

    fn projects(dir: &tempfile::TempDir) -> JsonStore<ProjectDefinition> {
        let store = JsonStore::new(dir.path().join("projects.json"));
        store.initialize().unwrap();
        for (id, domain) in [("shop", Some("shop.test")), ("worker", None)] {
            let id = ResourceId::new(id).unwrap();
            store
                .set(
                    id.as_str(),
                    ProjectDefinition {
                        id: id.clone(),
                        name: id.to_string(),
                        image: "app:latest".into(),
                        port: 3000,
                        host_port: None,
                        domain: domain.map(Into::into),
                        env: BTreeMap::new(),
                    },
                )
                .unwrap();
        }
        store
    }

    async fn run_hook(recorder: Arc<Recorder>) -> StevedoreResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let projects = projects(&dir);
        let catalog = Catalog::builtin().unwrap();
        let caddy = catalog.get(&ResourceId::new("caddy").unwrap()).unwrap();
        let hook = ProxySyncHook::new(recorder.clone(), Some(recorder));
        hook.run(&HookContext {
            definition: caddy,
            container_id: "abc",
            state: &RuntimeState::absent(),
            projects: &projects,
        })
        .await
    }

    #[tokio::test]
    async fn proxy_sync_routes_projects_with_domains() {
        let recorder = Arc::new(Recorder::default());
        run_hook(recorder.clone()).await.unwrap();

        let routes = recorder.routes.lock().clone();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].domain, "shop.test");
        assert_eq!(routes[0].upstream, "stevedore-shop:3000");
        assert_eq!(*recorder.hosts.lock(), vec!["add 127.0.0.1 shop.test".to_string()]);
    }

    #[tokio::test]
    async fn declined_elevation_is_reported() {
        let recorder = Arc::new(Recorder {
            decline: true,
            ..Recorder::default()
        });
        let err = run_hook(recorder).await.unwrap_err();
        assert_eq!(err.api_code(), "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn removed_project_loses_route_and_hosts_entry() {
        let dir = tempfile::tempdir().unwrap();
        let projects = projects(&dir);
        let recorder = Arc::new(Recorder::default());
        let hook = ProxySyncHook::new(recorder.clone(), Some(recorder.clone()));

        let worker = projects.delete("worker").unwrap().unwrap();
        hook.project_removed(&worker, &projects).await.unwrap();
        assert!(recorder.hosts.lock().is_empty());

        let shop = projects.delete("shop").unwrap().unwrap();
        hook.project_removed(&shop, &projects).await.unwrap();
        assert!(recorder.routes.lock().is_empty());
        assert_eq!(*recorder.hosts.lock(), vec!["remove 127.0.0.1 shop.test".to_string()]);
    }

    #[test]
    fn registry_lookup() {
        let mut registry = HookRegistry::new();
        let caddy = ResourceId::new("caddy").unwrap();
        let recorder = Arc::new(Recorder::default());
        registry.register(caddy.clone(), Arc::new(ProxySyncHook::new(recorder, None)));

        assert_eq!(registry.get(&caddy).unwrap().name(), "proxy-sync");
        assert!(registry.get(&ResourceId::new("redis").unwrap()).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_helper_maps_exit_status() {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let ok = CommandHostsHelper::new("/bin/sh").with_args(["-c", "exit 0", "helper"]);
        ok.apply(HostsOperation::Add, loopback, "a.test").await.unwrap();

        let declined = CommandHostsHelper::new("/bin/sh").with_args(["-c", "exit 126", "helper"]);
        let err = declined.apply(HostsOperation::Add, loopback, "a.test").await.unwrap_err();
        assert_eq!(err.api_code(), "PERMISSION_DENIED");

        let cancelled = CommandHostsHelper::new("/bin/sh")
            .with_args(["-c", "echo 'User cancelled' >&2; exit 1", "helper"]);
        let err = cancelled.apply(HostsOperation::Remove, loopback, "a.test").await.unwrap_err();
        assert_eq!(err.api_code(), "PERMISSION_DENIED");

        let broken = CommandHostsHelper::new("/bin/sh").with_args(["-c", "exit 3", "helper"]);
        let err = broken.apply(HostsOperation::Add, loopback, "a.test").await.unwrap_err();
        assert_eq!(err.api_code(), "HOOK_FAILED");
    }
}
