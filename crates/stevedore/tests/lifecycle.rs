//! Lifecycle scenarios against the in-memory runtime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stevedore::hooks::{HookContext, ProxyConfigurator, ProxyRoute};
use stevedore::{
    Catalog, Engine, HookRegistry, InstallOptions, PersistedResourceConfig, PostInstallHook,
    ProjectDefinition, ProxySyncHook, ResourceStatus, Stores,
};
use stevedore_common::{ResourceId, StevedoreError, StevedorePaths, StevedoreResult};
use stevedore_runtime::{ContainerRuntime, HealthBehavior, HealthStatus, MemoryRuntime};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    memory: Arc<MemoryRuntime>,
    engine: Arc<Engine>,
}

fn harness_with(hooks: HookRegistry) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let memory = Arc::new(MemoryRuntime::new());
    let runtime: Arc<dyn ContainerRuntime> = memory.clone();
    let stores = Stores::open(&StevedorePaths::with_root(dir.path())).unwrap();
    let engine = Engine::new(runtime, Catalog::builtin().unwrap(), stores).with_hooks(hooks);
    Harness {
        _dir: dir,
        memory,
        engine: Arc::new(engine),
    }
}

fn harness() -> Harness {
    harness_with(HookRegistry::new())
}

fn id(raw: &str) -> ResourceId {
    ResourceId::new(raw).unwrap()
}

fn position(calls: &[String], prefix: &str) -> usize {
    calls
        .iter()
        .position(|c| c.starts_with(prefix))
        .unwrap_or_else(|| panic!("no call starting with {prefix:?} in {calls:?}"))
}

#[test_log::test(tokio::test(start_paused = true))]
async fn install_redis_pulls_starts_and_waits_for_health() {
    let h = harness();
    let mut progress = h.engine.progress().subscribe();

    let outcome = h
        .engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();

    assert!(outcome.state.running);
    assert_eq!(outcome.state.health, HealthStatus::Healthy);
    assert!(outcome.warnings.is_empty());

    let mut last = None;
    while let Ok(update) = progress.try_recv() {
        last = Some(update);
    }
    let last = last.expect("pull progress was published");
    assert_eq!(last.resource_id, id("redis"));
    assert_eq!(last.bytes_done, last.bytes_total);
    assert!((last.percent() - 100.0).abs() < f64::EPSILON);

    let calls = h.memory.calls();
    let network = position(&calls, "ensure_network stevedore");
    let volume = position(&calls, "create_volume stevedore-redis-data");
    let pull = position(&calls, "pull redis:7-alpine");
    let create = position(&calls, "create stevedore-redis");
    let start = position(&calls, "start ");
    assert!(network < volume && volume < pull && pull < create && create < start);

    let record = h.engine.stores().installed.get("redis").unwrap().unwrap();
    assert_eq!(record.container_id, outcome.state.container_id);
    assert_eq!(record.desired, stevedore::DesiredState::Running);
    assert_eq!(record.volumes, vec!["stevedore-redis-data".to_string()]);

    assert_eq!(
        h.engine.status(&id("redis")).await.unwrap(),
        ResourceStatus::Running {
            health: HealthStatus::Healthy
        }
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn install_without_start_leaves_container_stopped() {
    let h = harness();
    let options = InstallOptions {
        start: false,
        ..InstallOptions::default()
    };

    let outcome = h.engine.install(&id("mailpit"), options).await.unwrap();
    assert!(outcome.state.exists);
    assert!(!outcome.state.running);
    assert_eq!(outcome.resource.desired, stevedore::DesiredState::Stopped);
    assert!(!h.memory.calls().iter().any(|c| c.starts_with("start ")));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn second_operation_on_busy_resource_fails_fast() {
    let h = harness();
    h.memory.set_latency(Duration::from_secs(1));

    let engine = Arc::clone(&h.engine);
    let first = tokio::spawn(async move { engine.install(&id("redis"), InstallOptions::default()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = h
        .engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.api_code(), "OPERATION_IN_PROGRESS");
    let err = h.engine.stop(&id("redis")).await.unwrap_err();
    assert_eq!(err.api_code(), "OPERATION_IN_PROGRESS");
    assert_eq!(h.engine.status(&id("redis")).await.unwrap(), ResourceStatus::Installing);

    // Other resources are not affected.
    let err = h.engine.start(&id("postgres")).await.unwrap_err();
    assert_eq!(err.api_code(), "NOT_INSTALLED");

    first.await.unwrap().unwrap();
    h.engine.stop(&id("redis")).await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn reinstall_is_rejected() {
    let h = harness();
    h.engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();

    let err = h
        .engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StevedoreError::AlreadyInstalled { .. }));

    // A labelled container counts as installed even without a record.
    h.engine.stores().installed.delete("redis").unwrap();
    let err = h
        .engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.api_code(), "ALREADY_INSTALLED");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn failed_start_removes_container_and_keeps_volume() {
    let h = harness();
    h.memory.fail_next("start", "port is already allocated");

    let err = h
        .engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.api_code(), "RUNTIME_ERROR");

    assert!(h.memory.container_spec("stevedore-redis").is_none());
    assert!(h.memory.volumes().contains(&"stevedore-redis-data".to_string()));
    assert!(!h.engine.stores().installed.has("redis").unwrap());
    assert_eq!(h.engine.status(&id("redis")).await.unwrap(), ResourceStatus::NotInstalled);

    // The resource can be installed again once the cause is gone.
    h.engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn unhealthy_install_times_out_and_rolls_back() {
    let h = harness();
    h.memory.set_health_behavior(HealthBehavior::NeverHealthy);

    let err = h
        .engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StevedoreError::HealthCheckTimeout { attempts: 10, .. }));
    assert!(h.memory.container_spec("stevedore-redis").is_none());
    assert!(!h.engine.stores().installed.has("redis").unwrap());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn cancelled_install_rolls_back() {
    let h = harness();
    h.memory.set_health_behavior(HealthBehavior::NeverHealthy);
    let options = InstallOptions::default();
    let cancel = options.cancel.clone();

    let engine = Arc::clone(&h.engine);
    let task = tokio::spawn(async move { engine.install(&id("redis"), options).await });
    tokio::time::sleep(Duration::from_secs(3)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.api_code(), "CANCELLED");
    assert!(h.memory.container_spec("stevedore-redis").is_none());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn stop_start_restart_record_desired_state() {
    let h = harness();
    h.engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();

    let state = h.engine.stop(&id("redis")).await.unwrap();
    assert!(!state.running);
    let record = h.engine.stores().installed.get("redis").unwrap().unwrap();
    assert_eq!(record.desired, stevedore::DesiredState::Stopped);
    assert_eq!(h.engine.status(&id("redis")).await.unwrap(), ResourceStatus::Stopped);

    let state = h.engine.start(&id("redis")).await.unwrap();
    assert!(state.running);
    let state = h.engine.restart(&id("redis")).await.unwrap();
    assert!(state.running);
    let record = h.engine.stores().installed.get("redis").unwrap().unwrap();
    assert_eq!(record.desired, stevedore::DesiredState::Running);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn lifecycle_requires_install() {
    let h = harness();
    for result in [
        h.engine.start(&id("redis")).await,
        h.engine.stop(&id("redis")).await,
        h.engine.restart(&id("redis")).await,
    ] {
        assert_eq!(result.unwrap_err().api_code(), "NOT_INSTALLED");
    }
    let err = h.engine.uninstall(&id("redis"), false).await.unwrap_err();
    assert_eq!(err.api_code(), "NOT_INSTALLED");

    let err = h.engine.start(&id("nope")).await.unwrap_err();
    assert_eq!(err.api_code(), "NOT_FOUND");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn uninstall_keeps_volume_and_clears_config() {
    let h = harness();
    h.engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();
    let mut config = PersistedResourceConfig::default();
    config.ports.insert(6379, 16379);
    h.engine.update_config(&id("redis"), config).unwrap();

    let outcome = h.engine.uninstall(&id("redis"), false).await.unwrap();
    assert!(outcome.container_removed);
    assert!(outcome.removed_volumes.is_empty());

    assert!(h.memory.container_spec("stevedore-redis").is_none());
    assert!(h.memory.volumes().contains(&"stevedore-redis-data".to_string()));
    assert!(h.engine.config(&id("redis")).unwrap().is_none());
    assert!(!h.engine.stores().installed.has("redis").unwrap());
    assert_eq!(h.engine.status(&id("redis")).await.unwrap(), ResourceStatus::NotInstalled);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn uninstall_can_remove_volumes() {
    let h = harness();
    h.engine
        .install(&id("postgres"), InstallOptions::default())
        .await
        .unwrap();

    let outcome = h.engine.uninstall(&id("postgres"), true).await.unwrap();
    assert_eq!(outcome.removed_volumes, vec!["stevedore-postgres-data".to_string()]);
    assert!(!h.memory.volumes().contains(&"stevedore-postgres-data".to_string()));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn reconfigure_does_not_touch_running_container() {
    let h = harness();
    h.engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();
    let before = h.memory.container_spec("stevedore-redis").unwrap();

    let mut config = PersistedResourceConfig::default();
    config.ports.insert(6379, 16379);
    config.env.insert("REDIS_ARGS".into(), "--maxmemory 64mb".into());
    h.engine.update_config(&id("redis"), config).unwrap();
    h.engine.start(&id("redis")).await.unwrap();

    assert_eq!(h.memory.container_spec("stevedore-redis").unwrap(), before);

    // The override applies to the next install.
    h.engine.uninstall(&id("redis"), false).await.unwrap();
    let mut config = PersistedResourceConfig::default();
    config.ports.insert(6379, 16379);
    h.engine.update_config(&id("redis"), config).unwrap();
    h.engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();
    let after = h.memory.container_spec("stevedore-redis").unwrap();
    assert_eq!(after.ports[0].host, 16379);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn invalid_config_is_rejected() {
    let h = harness();
    let mut config = PersistedResourceConfig::default();
    config.ports.insert(5432, 15432);

    let err = h.engine.update_config(&id("redis"), config).unwrap_err();
    assert_eq!(err.api_code(), "VALIDATION_ERROR");
    assert!(h.engine.config(&id("redis")).unwrap().is_none());
}

#[test_log::test]
fn updating_a_missing_record_is_not_found() {
    let h = harness();
    let before = h.engine.stores().installed.get_all().unwrap();

    let err = h
        .engine
        .stores()
        .installed
        .update("missing-id", serde_json::json!({ "desired": "stopped" }))
        .unwrap_err();
    assert!(matches!(err, StevedoreError::NotFound { .. }));
    assert_eq!(h.engine.stores().installed.get_all().unwrap(), before);
}

struct FailingHook;

#[async_trait]
impl PostInstallHook for FailingHook {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, ctx: &HookContext<'_>) -> StevedoreResult<()> {
        Err(StevedoreError::HookFailed {
            id: ctx.definition.id.to_string(),
            message: "routes could not be written".into(),
        })
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn hook_failure_becomes_a_warning() {
    let mut hooks = HookRegistry::new();
    hooks.register(id("redis"), Arc::new(FailingHook));
    let h = harness_with(hooks);

    let outcome = h
        .engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].hook, "failing");
    assert_eq!(outcome.warnings[0].code, "HOOK_FAILED");
    assert!(h.engine.stores().installed.has("redis").unwrap());
    assert!(h.memory.container_spec("stevedore-redis").is_some());
}

fn blog() -> ProjectDefinition {
    ProjectDefinition {
        id: id("blog"),
        name: "Blog".into(),
        image: "ghcr.io/acme/blog:latest".into(),
        port: 3000,
        host_port: Some(3000),
        domain: Some("blog.test".into()),
        env: Default::default(),
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn projects_install_like_services() {
    let h = harness();
    let definition = h.engine.register_project(blog()).unwrap();
    assert_eq!(definition.kind, stevedore_common::ResourceKind::Project);
    assert!(h.engine.list().unwrap().iter().any(|d| d.id == id("blog")));

    let outcome = h
        .engine
        .install(&id("blog"), InstallOptions::default())
        .await
        .unwrap();
    assert!(outcome.state.running);
    let labels = h.memory.container_spec("stevedore-blog").unwrap().labels;
    assert_eq!(labels.get("dev.stevedore.project-id").map(String::as_str), Some("blog"));

    let err = h.engine.remove_project(&id("blog")).await.unwrap_err();
    assert_eq!(err.api_code(), "VALIDATION_ERROR");

    h.engine.uninstall(&id("blog"), false).await.unwrap();
    h.engine.remove_project(&id("blog")).await.unwrap();
    assert_eq!(
        h.engine.definition(&id("blog")).unwrap_err().api_code(),
        "NOT_FOUND"
    );
}

#[derive(Default)]
struct RouteLog(parking_lot::Mutex<Vec<Vec<String>>>);

#[async_trait]
impl ProxyConfigurator for RouteLog {
    async fn apply_routes(&self, routes: &[ProxyRoute]) -> StevedoreResult<()> {
        self.0.lock().push(routes.iter().map(|r| r.domain.clone()).collect());
        Ok(())
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn removing_a_project_drops_its_proxy_route() {
    let routes = Arc::new(RouteLog::default());
    let mut hooks = HookRegistry::new();
    hooks.register(id("caddy"), Arc::new(ProxySyncHook::new(routes.clone(), None)));
    let h = harness_with(hooks);

    h.engine.register_project(blog()).unwrap();
    h.engine
        .install(&id("caddy"), InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(routes.0.lock().last().unwrap(), &vec!["blog.test".to_string()]);

    h.engine.remove_project(&id("blog")).await.unwrap();
    assert!(routes.0.lock().last().unwrap().is_empty());
}

#[test_log::test]
fn project_ids_cannot_shadow_services() {
    let h = harness();
    let mut project = blog();
    project.id = id("redis");
    let err = h.engine.register_project(project).unwrap_err();
    assert_eq!(err.api_code(), "VALIDATION_ERROR");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn sync_installed_clears_vanished_containers() {
    let h = harness();
    h.engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();
    h.engine
        .install(&id("mailpit"), InstallOptions::default())
        .await
        .unwrap();
    h.engine.stores().installed.delete("mailpit").unwrap();
    assert!(h.memory.forget_container("stevedore-redis"));

    let report = h.engine.sync_installed().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.vanished, vec![id("redis")]);
    assert_eq!(report.orphans, vec![id("mailpit")]);

    let record = h.engine.stores().installed.get("redis").unwrap().unwrap();
    assert!(record.container_id.is_none());
    assert_eq!(h.engine.status(&id("redis")).await.unwrap(), ResourceStatus::Missing);

    // A second pass finds nothing new.
    let report = h.engine.sync_installed().await.unwrap();
    assert!(report.vanished.is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn summaries_degrade_when_runtime_is_down() {
    let h = harness();
    h.engine
        .install(&id("redis"), InstallOptions::default())
        .await
        .unwrap();

    let summaries = h.engine.summaries().await.unwrap();
    assert_eq!(summaries.len(), Catalog::builtin().unwrap().len());
    let redis = summaries.iter().find(|s| s.definition.id == id("redis")).unwrap();
    assert!(matches!(redis.status, ResourceStatus::Running { .. }));
    assert!(redis.installed.is_some());

    h.memory.set_unavailable(true);
    let summaries = h.engine.summaries().await.unwrap();
    assert!(summaries.iter().all(|s| s.status == ResourceStatus::Unknown));
}
