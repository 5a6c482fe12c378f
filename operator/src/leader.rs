//! Single-leader guard over a coordination.k8s.io Lease.
//!
//! The operator tolerates running as multiple replicas for availability,
//! but only one replica may reconcile. Replicas race for one Lease; the
//! winner renews it in the background and the others keep retrying until
//! the holder stops renewing.
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
    chrono::Utc,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client,
};
use tracing::{debug, info, warn};

/// Name of the Lease all operator replicas compete for.
pub const LEASE_NAME: &str = "gantry-leader";

const LEASE_DURATION_SECONDS: i32 = 30;
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Block until this process holds the leader lease, then renew it from a
/// background task for the life of the process.
pub async fn acquire(client: Client, namespace: &str, identity: String) -> Result<()> {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire(&leases, &identity).await {
            Ok(true) => break,
            Ok(false) => {
                debug!(identity, "leader lease is held elsewhere, waiting");
            }
            Err(err) => {
                warn!(%err, "failed to contend for leader lease");
            }
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
    info!(identity, "acquired leader lease");

    let renew_identity = identity.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            if let Err(err) = renew(&leases, &renew_identity).await {
                warn!(%err, "failed to renew leader lease");
            }
        }
    });

    Ok(())
}

async fn try_acquire(leases: &Api<Lease>, identity: &str) -> Result<bool> {
    let now = MicroTime(Utc::now());

    let Some(lease) = leases.get_opt(LEASE_NAME).await? else {
        let lease = Lease {
            metadata: kube::core::ObjectMeta {
                name: Some(LEASE_NAME.to_owned()),
                ..Default::default()
            },
            spec: Some(lease_spec(identity, now, 0)),
        };
        return match leases.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => Ok(false),
            Err(err) => Err(err.into()),
        };
    };

    let spec = lease.spec.clone().unwrap_or_default();
    if spec.holder_identity.as_deref() == Some(identity) {
        return Ok(true);
    }

    let duration = spec
        .lease_duration_seconds
        .unwrap_or(LEASE_DURATION_SECONDS) as i64;
    let lapsed = spec
        .renew_time
        .as_ref()
        .map(|renewed| (now.0 - renewed.0).num_seconds() >= duration)
        .unwrap_or(true);
    if !lapsed {
        return Ok(false);
    }

    // The holder stopped renewing; take the lease over. A conflict means
    // another replica won the same race.
    let transitions = spec.lease_transitions.unwrap_or(0) + 1;
    let taken = Lease {
        metadata: lease.metadata.clone(),
        spec: Some(lease_spec(identity, now, transitions)),
    };
    match leases
        .replace(LEASE_NAME, &PostParams::default(), &taken)
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
        Err(err) => Err(err.into()),
    }
}

async fn renew(leases: &Api<Lease>, identity: &str) -> Result<()> {
    let Some(lease) = leases.get_opt(LEASE_NAME).await? else {
        warn!(identity, "leader lease disappeared");
        return Ok(());
    };
    let holder = lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.as_deref());
    if holder != Some(identity) {
        warn!(identity, ?holder, "leader lease was taken over");
        return Ok(());
    }

    leases
        .patch(
            LEASE_NAME,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({
                "spec": { "renewTime": MicroTime(Utc::now()) }
            })),
        )
        .await?;
    Ok(())
}

fn lease_spec(identity: &str, now: MicroTime, transitions: i32) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(identity.to_owned()),
        acquire_time: Some(now.clone()),
        renew_time: Some(now),
        lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
        lease_transitions: Some(transitions),
    }
}
