use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{ClusterRegistry, ManagedCluster, Reachability};

/// Probes in flight at once.
const MAX_CONCURRENT_PROBES: usize = 10;

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before a cluster is marked unreachable.
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Periodically probes every registered cluster and records reachability.
pub struct HealthChecker {
    registry: Arc<ClusterRegistry>,
    settings: HealthSettings,
}

impl HealthChecker {
    pub fn new(registry: Arc<ClusterRegistry>, settings: HealthSettings) -> Self {
        Self { registry, settings }
    }

    /// Probe all clusters once.
    pub async fn check_once(&self) {
        let clusters = self.registry.list().await;
        stream::iter(clusters)
            .map(|c| self.probe(c))
            .buffer_unordered(MAX_CONCURRENT_PROBES)
            .collect::<Vec<()>>()
            .await;
    }

    async fn probe(&self, cluster: Arc<ManagedCluster>) {
        let api = cluster.api();
        let outcome = tokio::time::timeout(self.settings.probe_timeout, api.probe()).await;
        let now = Utc::now();
        match outcome {
            Ok(Ok(())) => {
                let prev = cluster.record_success(now);
                if prev == Reachability::Unreachable {
                    info!(cluster = %cluster.name, "health: cluster reachable again");
                } else {
                    debug!(cluster = %cluster.name, "health: probe ok");
                }
            }
            Ok(Err(e)) => self.failed(&cluster, now, &e.to_string()),
            Err(_) => self.failed(&cluster, now, "probe timed out"),
        }
    }

    fn failed(&self, cluster: &ManagedCluster, now: chrono::DateTime<Utc>, reason: &str) {
        let prev = cluster.record_failure(now, self.settings.failure_threshold);
        let health = cluster.health();
        if prev != Reachability::Unreachable && health.reachability == Reachability::Unreachable {
            warn!(
                cluster = %cluster.name,
                failures = health.consecutive_failures,
                error = %reason,
                "health: cluster marked unreachable"
            );
        } else {
            debug!(cluster = %cluster.name, failures = health.consecutive_failures, error = %reason, "health: probe failed");
        }
    }

    /// Run until cancelled: one check immediately, then one per interval.
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("health: checker stopped");
                    return;
                }
                _ = ticker.tick() => self.check_once().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;
    use crate::source::{ClusterDescriptor, StaticSource};

    async fn setup(threshold: u32) -> (Arc<ClusterRegistry>, MemoryConnector, HealthChecker) {
        let connector = MemoryConnector::new();
        let reg = Arc::new(ClusterRegistry::new(
            Arc::new(StaticSource::new(vec![
                ClusterDescriptor::local("a"),
                ClusterDescriptor {
                    is_default: false,
                    ..ClusterDescriptor::local("b")
                },
            ])),
            Arc::new(connector.clone()),
        ));
        reg.sync().await.unwrap();
        let checker = HealthChecker::new(
            reg.clone(),
            HealthSettings {
                interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(200),
                failure_threshold: threshold,
            },
        );
        (reg, connector, checker)
    }

    #[tokio::test]
    async fn marks_unreachable_after_threshold_and_recovers() {
        let (reg, connector, checker) = setup(3).await;
        connector.cluster("a").set_probe_failing(true);

        checker.check_once().await;
        checker.check_once().await;
        let a = reg.resolve("a").await.unwrap();
        assert_eq!(a.reachability(), Reachability::Unknown);
        assert_eq!(a.health().consecutive_failures, 2);

        checker.check_once().await;
        assert_eq!(a.reachability(), Reachability::Unreachable);
        assert_eq!(
            reg.resolve("b").await.unwrap().reachability(),
            Reachability::Reachable
        );
        assert_eq!(reg.len().await, 2);
        let eligible: Vec<_> = reg.reachable().await.iter().map(|c| c.name.clone()).collect();
        assert_eq!(eligible, vec!["b"]);

        connector.cluster("a").set_probe_failing(false);
        checker.check_once().await;
        assert_eq!(a.reachability(), Reachability::Reachable);
        assert_eq!(a.health().consecutive_failures, 0);
        assert!(a.health().last_checked_at.is_some());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn transition_to_unreachable_is_logged_once() {
        let (_reg, connector, checker) = setup(1).await;
        connector.cluster("b").set_reachable(false);
        checker.check_once().await;
        checker.check_once().await;
        assert!(logs_contain("cluster=b"));
        logs_assert(|lines: &[&str]| {
            let n = lines
                .iter()
                .filter(|l| l.contains("health: cluster marked unreachable"))
                .count();
            match n {
                1 => Ok(()),
                n => Err(format!("unreachable transition logged {n} times")),
            }
        });
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (reg, _connector, checker) = setup(1).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(checker.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(
            reg.resolve("a").await.unwrap().reachability(),
            Reachability::Reachable
        );
    }
}
