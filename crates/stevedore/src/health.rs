//! Health check polling.

use std::time::Duration;

use stevedore_common::{ResourceId, StevedoreError, StevedoreResult};
use stevedore_runtime::{ContainerRuntime, HealthCheckSpec, HealthStatus, RuntimeState};
use tokio_util::sync::CancellationToken;

/// Sleep unless cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken, id: &ResourceId) -> StevedoreResult<()> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        () = cancel.cancelled() => Err(StevedoreError::Cancelled { id: id.to_string() }),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Poll `container` until the runtime reports it healthy.
///
/// Waits `start_period`, then inspects up to `retries` times spaced by
/// `interval`, each inspection bounded by `timeout`. Cancellation is checked
/// before every attempt; an inspection already in flight is never
/// interrupted.
///
/// # Errors
///
/// - [`StevedoreError::Cancelled`] if `cancel` fires
/// - [`StevedoreError::HealthCheckTimeout`] when retries run out or the
///   runtime declares the container unhealthy
/// - [`StevedoreError::Runtime`] if the container stops while being checked
pub async fn wait_until_healthy(
    runtime: &dyn ContainerRuntime,
    id: &ResourceId,
    container: &str,
    check: &HealthCheckSpec,
    cancel: &CancellationToken,
) -> StevedoreResult<RuntimeState> {
    tracing::debug!(
        resource = %id,
        retries = check.retries,
        interval = ?check.interval,
        start_period = ?check.start_period,
        "Waiting for health check"
    );
    pause(check.start_period, cancel, id).await?;

    for attempt in 1..=check.retries {
        if cancel.is_cancelled() {
            return Err(StevedoreError::Cancelled { id: id.to_string() });
        }

        match tokio::time::timeout(check.timeout, runtime.inspect(container)).await {
            Ok(Ok(state)) => {
                if !state.running {
                    return Err(StevedoreError::runtime(format!(
                        "{container} stopped while waiting for it to become healthy"
                    )));
                }
                match state.health {
                    HealthStatus::Healthy => {
                        tracing::info!(resource = %id, attempt, "Health check passed");
                        return Ok(state);
                    }
                    HealthStatus::Unhealthy => {
                        tracing::warn!(resource = %id, attempt, "Runtime reports container unhealthy");
                        return Err(StevedoreError::HealthCheckTimeout {
                            id: id.to_string(),
                            attempts: attempt,
                        });
                    }
                    HealthStatus::Starting | HealthStatus::None => {
                        tracing::trace!(resource = %id, attempt, health = %state.health, "Not healthy yet");
                    }
                }
            }
            Ok(Err(e)) if e.is_unavailable() => return Err(e),
            Ok(Err(e)) => {
                tracing::debug!(resource = %id, attempt, error = %e, "Health probe failed");
            }
            Err(_) => {
                tracing::debug!(resource = %id, attempt, "Health probe timed out");
            }
        }

        if attempt < check.retries {
            pause(check.interval, cancel, id).await?;
        }
    }

    Err(StevedoreError::HealthCheckTimeout {
        id: id.to_string(),
        attempts: check.retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::collections::BTreeMap;
    use stevedore_common::labels;
    use stevedore_runtime::{ContainerSpec, HealthBehavior, MemoryRuntime};

    fn check(retries: u32) -> HealthCheckSpec {
        HealthCheckSpec {
            command: vec!["CMD".into(), "true".into()],
            retries,
            timeout: Duration::from_secs(1),
            interval: Duration::from_secs(2),
            start_period: Duration::from_secs(5),
        }
    }

    async fn started(runtime: &MemoryRuntime) -> String {
        runtime.pull_image("app:1").await.unwrap().count().await;
        let id = runtime
            .create_container(&ContainerSpec {
                name: "stevedore-app".into(),
                image: "app:1".into(),
                command: Vec::new(),
                env: BTreeMap::new(),
                ports: Vec::new(),
                volumes: Vec::new(),
                labels: labels::shared(),
                network: None,
                healthcheck: Some(check(3)),
            })
            .await
            .unwrap();
        runtime.start(&id).await.unwrap();
        id
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_healthy_within_retries() {
        let runtime = MemoryRuntime::new();
        runtime.set_health_behavior(HealthBehavior::HealthyAfter(3));
        let container = started(&runtime).await;
        let id = ResourceId::new("app").unwrap();

        let begin = tokio::time::Instant::now();
        let state = wait_until_healthy(&runtime, &id, &container, &check(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.health, HealthStatus::Healthy);
        // start period + two intervals
        assert_eq!(begin.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retries() {
        let runtime = MemoryRuntime::new();
        runtime.set_health_behavior(HealthBehavior::NeverHealthy);
        let container = started(&runtime).await;
        let id = ResourceId::new("app").unwrap();

        let err = wait_until_healthy(&runtime, &id, &container, &check(3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StevedoreError::HealthCheckTimeout { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let runtime = MemoryRuntime::new();
        runtime.set_health_behavior(HealthBehavior::NeverHealthy);
        let container = started(&runtime).await;
        let id = ResourceId::new("app").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_until_healthy(&runtime, &id, &container, &check(3), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.api_code(), "CANCELLED");
    }
}
