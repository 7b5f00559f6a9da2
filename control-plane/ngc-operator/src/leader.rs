//! Lease-based leader election. Only the holder of the lease runs workers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Client;
use kube::api::{Api, PostParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum LeaderError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseAction {
    Renew,
    TakeOver,
    Wait,
}

/// A lease without renew time or duration counts as expired.
fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew = spec.and_then(|s| s.renew_time.as_ref());
    let ttl = spec.and_then(|s| s.lease_duration_seconds);
    match (renew, ttl) {
        (Some(rt), Some(secs)) => now > rt.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    }
}

fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        LeaseAction::Renew
    } else if lease_expired(spec, now) {
        LeaseAction::TakeOver
    } else {
        LeaseAction::Wait
    }
}

pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    ttl: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str, ttl: Duration) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            ttl: ttl.max(Duration::from_secs(3)),
        }
    }

    fn renew_interval(&self) -> Duration {
        self.ttl / 3
    }

    /// Block until the lease is ours. `false` if cancelled first.
    pub async fn acquire(&self, token: &CancellationToken) -> bool {
        info!(identity = %self.identity, lease = %self.lease_name, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return true;
                }
                Ok(false) => debug!(identity = %self.identity, "lease held by another"),
                Err(e) => warn!(identity = %self.identity, error = %e, "lease acquire failed"),
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.renew_interval()) => {}
            }
        }
    }

    /// Renew until the lease is lost or `token` is cancelled. Losing the
    /// lease cancels `token`.
    pub async fn hold(&self, token: CancellationToken) {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.renew_interval()) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "leadership lost to another holder");
                    token.cancel();
                    return;
                }
                Err(e) if last_renewed.elapsed() >= self.ttl => {
                    warn!(identity = %self.identity, error = %e, "lease expired without renewal");
                    token.cancel();
                    return;
                }
                Err(e) => warn!(identity = %self.identity, error = %e, "lease renew failed, retrying"),
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };
        let Some(mut lease) = existing else {
            return self.create(&api, now).await;
        };

        let spec = lease.spec.clone();
        let next = match decide(spec.as_ref(), &self.identity, now) {
            LeaseAction::Wait => return Ok(false),
            LeaseAction::Renew => LeaseSpec {
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(self.ttl_secs()),
                ..spec.unwrap_or_default()
            },
            LeaseAction::TakeOver => {
                let transitions = spec.as_ref().and_then(|s| s.lease_transitions).unwrap_or(0);
                info!(identity = %self.identity, "taking over expired lease");
                LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(self.ttl_secs()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(transitions + 1),
                    ..Default::default()
                }
            }
        };
        lease.spec = Some(next);
        // resourceVersion from the read makes this a compare-and-swap.
        match api.replace(&self.lease_name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool, LeaderError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.ttl_secs()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn ttl_secs(&self) -> i32 {
        i32::try_from(self.ttl.as_secs()).unwrap_or(i32::MAX)
    }
}
