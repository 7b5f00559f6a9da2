use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use ngc_cluster::config::ClustersConfig;
use ngc_cluster::kube_api::KubeClusterApi;
use ngc_cluster::source::{HubSource, KubeConnector, StaticSource};
use ngc_cluster::{ClusterDescriptor, ClusterRegistry, ClusterSource, Connector, HealthChecker};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{OperatorConfig, RegistryMode};
use crate::controller::publish::{ExternalPublisher, Unconfigured, XcPublisher};
use crate::controller::queue::WorkQueue;
use crate::controller::reconcile::Dispatcher;
use crate::controller::watch::EventSources;
use crate::controller::workers::WorkerPool;
use crate::controller::ControllerContext;
use crate::leader::LeaderElector;
use crate::metrics::{Metrics, metrics_router};
use crate::web::{self, Readiness, probe_router};

/// Process-level options from the command line.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub metrics_addr: SocketAddr,
    pub probe_addr: SocketAddr,
    pub leader_elect: bool,
}

/// Registry wired for the configured membership mode.
pub async fn build_registry(cfg: &OperatorConfig) -> anyhow::Result<Arc<ClusterRegistry>> {
    let timeout = cfg.api_timeout();
    let (source, connector): (Arc<dyn ClusterSource>, Arc<dyn Connector>) = match cfg.registry_mode() {
        RegistryMode::File(path) => {
            let file = ClustersConfig::load(&path)?;
            info!(%path, clusters = file.clusters.len(), "registry: loaded cluster file");
            // Secret-backed entries read their kubeconfig through the ambient cluster.
            let hub = Client::try_default().await.ok();
            (
                Arc::new(StaticSource::from_config(&file)),
                Arc::new(KubeConnector::new(hub, "default", timeout)),
            )
        }
        RegistryMode::Hub(ns) => {
            let hub = Client::try_default().await?;
            info!(%ns, "registry: reading ManagedCluster objects from hub");
            (
                Arc::new(HubSource::new(Arc::new(KubeClusterApi::new(hub.clone(), timeout)), ns.clone())),
                Arc::new(KubeConnector::new(Some(hub), ns, timeout)),
            )
        }
        RegistryMode::Local => (
            Arc::new(StaticSource::new(vec![ClusterDescriptor::local("default")])),
            Arc::new(KubeConnector::new(None, "default", timeout)),
        ),
    };
    Ok(Arc::new(ClusterRegistry::new(source, connector)))
}

async fn sync_registry(registry: Arc<ClusterRegistry>, readiness: Arc<Readiness>, every: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = registry.sync().await {
                    warn!(error = %e, "registry sync failed");
                }
                readiness.set_has_clusters(!registry.is_empty().await);
            }
        }
    }
}

fn identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("ngc-operator-{}", std::process::id()))
}

/// Start every component and wait until shutdown.
pub async fn run_all(cfg: OperatorConfig, opts: RuntimeOptions) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let registry = build_registry(&cfg).await?;
    let metrics = Arc::new(Metrics::new()?);
    let readiness = Arc::new(Readiness::new(opts.leader_elect));
    let publisher: Arc<dyn ExternalPublisher> = match cfg.xc_api_token.as_deref().filter(|t| !t.is_empty()) {
        Some(t) => Arc::new(XcPublisher::new(t, cfg.api_timeout())?),
        None => {
            warn!("XC_API_TOKEN not set; distributed-cloud cleanup will block deletion");
            Arc::new(Unconfigured)
        }
    };

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    tasks.spawn(web::serve(
        "metrics",
        opts.metrics_addr,
        metrics_router(metrics.clone(), registry.clone()),
        token.clone(),
    ));
    tasks.spawn(web::serve(
        "probes",
        opts.probe_addr,
        probe_router(readiness.clone()),
        token.clone(),
    ));
    {
        let (r, rd, t) = (registry.clone(), readiness.clone(), token.clone());
        let every = cfg.registry_sync_interval();
        tasks.spawn(async move {
            sync_registry(r, rd, every, t).await;
            Ok(())
        });
    }
    {
        let checker = HealthChecker::new(registry.clone(), cfg.health_settings());
        let t = token.clone();
        tasks.spawn(async move {
            checker.run(t).await;
            Ok(())
        });
    }
    {
        let t = token.clone();
        tasks.spawn(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    info!("shutdown requested");
                    t.cancel();
                }
                _ = t.cancelled() => {}
            }
            Ok(())
        });
    }

    // Work runs under its own token so losing the lease stops it first.
    let work = token.child_token();
    if opts.leader_elect {
        let elector = LeaderElector::new(
            Client::try_default().await?,
            &cfg.lease.name,
            &cfg.lease.namespace,
            &identity(),
            Duration::from_secs(cfg.lease.ttl_secs),
        );
        if elector.acquire(&token).await {
            readiness.set_leading(true);
            let (w, rd) = (work.clone(), readiness.clone());
            tasks.spawn(async move {
                elector.hold(w).await;
                rd.set_leading(false);
                Ok(())
            });
        }
    }

    if !token.is_cancelled() {
        let queue = WorkQueue::new(cfg.backoff());
        let settings = cfg.reconcile_settings();
        let unreachable_retry = settings.resync;
        let ctx = Arc::new(ControllerContext {
            registry: registry.clone(),
            publisher,
            metrics: metrics.clone(),
            settings,
            token: work.clone(),
        });
        let dispatcher = Arc::new(Dispatcher::standard(ctx));
        info!(kinds = ?dispatcher.kinds(), workers = cfg.workers, "starting reconcilers");

        let sources = EventSources {
            registry: registry.clone(),
            queue: queue.clone(),
        };
        let w = work.clone();
        tasks.spawn(async move {
            sources.run(w).await;
            Ok(())
        });
        {
            let (q, w, t) = (queue.clone(), work.clone(), token.clone());
            tasks.spawn(async move {
                w.cancelled().await;
                q.shutdown();
                // Lost leadership ends the process; a fresh replica re-acquires.
                t.cancel();
                Ok(())
            });
        }
        let pool = WorkerPool {
            queue,
            dispatcher,
            metrics,
            workers: cfg.workers,
            unreachable_retry,
        };
        tasks.spawn(async move {
            pool.run().await;
            Ok(())
        });
    }

    let mut first_err = None;
    while let Some(res) = tasks.join_next().await {
        let err = match res {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) => e.into(),
        };
        error!(error = %err, "component failed, shutting down");
        token.cancel();
        first_err.get_or_insert(err);
    }
    info!("operator stopped");
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
