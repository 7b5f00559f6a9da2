//! Event sources: watches on every registered cluster feeding the work queue.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, ResourceExt};
use ngc_cluster::{ClusterRegistry, ConnectionRef, api_resource};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::planner::gateway_bundle::{GATEWAY_API_VERSION, NGINX_PROXY_API_VERSION, SNIPPETS_FILTER_API_VERSION};
use super::planner::inference_stack::{KEDA_API_VERSION, POOL_API_VERSION, ROUTE_API_VERSION};
use super::queue::WorkQueue;
use super::{DeclaredKind, WorkKey};
use crate::crd::common::{API_VERSION, MANAGED_BY, MANAGED_BY_LABEL};

/// Every kind the planners emit, as `(apiVersion, kind)`.
pub const CHILD_KINDS: &[(&str, &str)] = &[
    (POOL_API_VERSION, "InferencePool"),
    ("v1", "ConfigMap"),
    (ROUTE_API_VERSION, "HTTPRoute"),
    ("apps/v1", "DaemonSet"),
    (KEDA_API_VERSION, "ScaledObject"),
    (NGINX_PROXY_API_VERSION, "NginxProxy"),
    (GATEWAY_API_VERSION, "Gateway"),
    (SNIPPETS_FILTER_API_VERSION, "SnippetsFilter"),
];

/// Drops declared-object events that cannot change the outcome of a pass:
/// status-only writes (our own included) leave the generation untouched.
#[derive(Debug, Default)]
pub struct EventFilter {
    seen: HashMap<String, (Option<i64>, bool)>,
}

impl EventFilter {
    pub fn admit(&mut self, obj: &DynamicObject) -> bool {
        let Some(uid) = obj.metadata.uid.clone() else {
            return true;
        };
        let state = (obj.metadata.generation, obj.metadata.deletion_timestamp.is_some());
        self.seen.insert(uid, state) != Some(state)
    }

    pub fn forget(&mut self, obj: &DynamicObject) {
        if let Some(uid) = &obj.metadata.uid {
            self.seen.remove(uid);
        }
    }
}

pub fn declared_key(cluster: &str, kind: DeclaredKind, obj: &DynamicObject) -> Option<WorkKey> {
    let ns = obj.namespace()?;
    Some(WorkKey::new(cluster, kind, &ns, &obj.name_any()))
}

/// Key of the declared object that controls `child`, if any.
pub fn owner_key(cluster: &str, child: &DynamicObject) -> Option<WorkKey> {
    let ns = child.namespace()?;
    child
        .owner_references()
        .iter()
        .filter(|o| o.api_version == API_VERSION)
        .find_map(|o| DeclaredKind::from_kind(&o.kind).map(|k| WorkKey::new(cluster, k, &ns, &o.name)))
}

async fn watch_declared(
    cluster: String,
    client: Client,
    kind: DeclaredKind,
    queue: Arc<WorkQueue<WorkKey>>,
    token: CancellationToken,
) {
    let api: Api<DynamicObject> = Api::all_with(client, &kind.resource());
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    futures_util::pin_mut!(stream);
    let mut filter = EventFilter::default();
    loop {
        let ev = tokio::select! {
            _ = token.cancelled() => break,
            ev = stream.next() => ev,
        };
        match ev {
            None => break,
            Some(Ok(Event::Apply(obj) | Event::InitApply(obj))) => {
                if filter.admit(&obj) {
                    if let Some(key) = declared_key(&cluster, kind, &obj) {
                        debug!(%key, "declared object changed");
                        queue.add(key);
                    }
                }
            }
            Some(Ok(Event::Delete(obj))) => {
                filter.forget(&obj);
                if let Some(key) = declared_key(&cluster, kind, &obj) {
                    queue.add(key);
                }
            }
            Some(Ok(Event::Init | Event::InitDone)) => {}
            Some(Err(e)) => warn!(%cluster, %kind, error = %e, "watch error"),
        }
    }
}

async fn watch_children(
    cluster: String,
    client: Client,
    api_version: &'static str,
    kind: &'static str,
    queue: Arc<WorkQueue<WorkKey>>,
    token: CancellationToken,
) {
    let api: Api<DynamicObject> = Api::all_with(client, &api_resource(api_version, kind));
    let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY}");
    let stream = watcher(api, watcher::Config::default().labels(&selector)).default_backoff();
    futures_util::pin_mut!(stream);
    loop {
        let ev = tokio::select! {
            _ = token.cancelled() => break,
            ev = stream.next() => ev,
        };
        match ev {
            None => break,
            Some(Ok(Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj))) => {
                if let Some(key) = owner_key(&cluster, &obj) {
                    queue.add(key);
                }
            }
            Some(Ok(Event::Init | Event::InitDone)) => {}
            // Usually a child CRD that is not installed on this cluster.
            Some(Err(e)) => debug!(%cluster, child_kind = kind, error = %e, "child watch error"),
        }
    }
}

async fn watch_cluster(cluster: String, client: Client, queue: Arc<WorkQueue<WorkKey>>, token: CancellationToken) {
    let mut set = JoinSet::new();
    for kind in DeclaredKind::ALL {
        set.spawn(watch_declared(cluster.clone(), client.clone(), kind, queue.clone(), token.clone()));
    }
    for (api_version, kind) in CHILD_KINDS {
        set.spawn(watch_children(
            cluster.clone(),
            client.clone(),
            *api_version,
            *kind,
            queue.clone(),
            token.clone(),
        ));
    }
    while set.join_next().await.is_some() {}
    debug!(%cluster, "cluster watches stopped");
}

/// Keeps one set of watches per registered cluster, following registry
/// membership and connection changes.
pub struct EventSources {
    pub registry: Arc<ClusterRegistry>,
    pub queue: Arc<WorkQueue<WorkKey>>,
}

impl EventSources {
    pub async fn run(self, token: CancellationToken) {
        let mut changes = self.registry.subscribe();
        let mut running: HashMap<String, (ConnectionRef, CancellationToken)> = HashMap::new();
        loop {
            self.refresh(&mut running, &token).await;
            tokio::select! {
                _ = token.cancelled() => break,
                changed = changes.changed() => if changed.is_err() { break },
            }
        }
        for (_, (_, t)) in running.drain() {
            t.cancel();
        }
    }

    async fn refresh(&self, running: &mut HashMap<String, (ConnectionRef, CancellationToken)>, token: &CancellationToken) {
        let clusters = self.registry.list().await;
        running.retain(|name, (_, t)| {
            let keep = clusters.iter().any(|c| &c.name == name);
            if !keep {
                info!(cluster = %name, "stopping watches for removed cluster");
                t.cancel();
            }
            keep
        });
        for c in clusters {
            if let Some((conn, _)) = running.get(&c.name) {
                if *conn == c.connection {
                    continue;
                }
            }
            if let Some((_, old)) = running.remove(&c.name) {
                old.cancel();
            }
            let Some(client) = c.api().kube_client() else {
                debug!(cluster = %c.name, "no kube client, not watching");
                continue;
            };
            let child = token.child_token();
            info!(cluster = %c.name, "starting watches");
            tokio::spawn(watch_cluster(c.name.clone(), client, self.queue.clone(), child.clone()));
            running.insert(c.name.clone(), (c.connection.clone(), child));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use kube::discovery::ApiResource;

    fn obj(uid: &str, generation: i64) -> DynamicObject {
        let mut o = DynamicObject::new("s", &ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&()))
            .within("ns");
        o.metadata.uid = Some(uid.into());
        o.metadata.generation = Some(generation);
        o
    }

    #[test]
    fn status_only_updates_are_filtered() {
        let mut f = EventFilter::default();
        assert!(f.admit(&obj("u1", 1)));
        assert!(!f.admit(&obj("u1", 1)));
        assert!(f.admit(&obj("u1", 2)));
        let mut deleting = obj("u1", 2);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(f.admit(&deleting));
        f.forget(&deleting);
        assert!(f.admit(&obj("u1", 2)));
    }

    #[test]
    fn child_events_map_to_their_owner() {
        let mut child = obj("c1", 1);
        child.metadata.owner_references = Some(vec![
            OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaSet".into(),
                name: "rs".into(),
                uid: "x".into(),
                ..Default::default()
            },
            OwnerReference {
                api_version: API_VERSION.into(),
                kind: "GatewayBundle".into(),
                name: "edge".into(),
                uid: "y".into(),
                controller: Some(true),
                ..Default::default()
            },
        ]);
        let key = owner_key("east", &child).unwrap();
        assert_eq!(key, WorkKey::new("east", DeclaredKind::GatewayBundle, "ns", "edge"));
        assert!(owner_key("east", &obj("c2", 1)).is_none());
    }
}
