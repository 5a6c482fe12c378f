//! Level-triggered control loop driving LoadTests to completion.
//!
//! Each reconcile re-derives everything from observed state: defaults are
//! applied, status is folded from owned pods, and any missing pods are
//! gang-scheduled against a fresh cluster snapshot.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use futures::stream::StreamExt;
use gantry_common::load_test::{
    Component, LoadTest, LoadTestState, LoadTestStatus, CONFIGURATION_ERROR,
    FAILED_SETTING_DEFAULTS_ERROR, KUBERNETES_ERROR, POOL_ERROR,
};
use k8s_openapi::{
    api::core::v1::{ConfigMap, Pod},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    client::Client,
    core::ObjectMeta,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Api, ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::defaults::Defaults;
use crate::labels::{
    managed_labels, Role, GENERATED_LABEL, MANAGED_BY_LABEL_SELECTOR, POOL_LABEL,
};
use crate::loadtest::{cluster::ClusterInfo, pod::PodBuilder, status, SCENARIOS_KEY};
use crate::utils::{is_already_exists, Clock, ClusterApi, Context, KubeClusterApi};

/// Delay before a deferred test is admitted again.
const ADMISSION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Errors produced by the reconcile function. These are controller errors:
/// transient operational failures that are retried with a requeue. User
/// errors never surface here; they are recorded on the test status and the
/// reconcile completes without retrying.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The orchestrator rejected or failed an operation.
    #[error("Kube error: {source}")]
    Kube {
        /// Underlying apiserver error.
        #[from]
        source: kube::Error,
    },
    /// Locally observed state has not caught up with the apiserver.
    #[error("could not invalidate the cache which is required to gang schedule")]
    CacheSync,
    /// The invocation outlived the configured reconciliation timeout.
    #[error("reconcile timed out")]
    Timeout,
    /// Any other operational failure.
    #[error("App error: {source}")]
    App {
        /// Underlying error.
        #[from]
        source: anyhow::Error,
    },
}

// An error with the test configuration or the test itself, recorded on the
// status under a stable reason tag and never retried.
struct UserError {
    reason: &'static str,
    message: String,
}

/// Handle errors during reconciliation.
fn on_error<A, C>(test: Arc<LoadTest>, error: &Error, _context: Arc<Context<A, C>>) -> Action {
    warn!(test = test.name_any(), %error, "reconcile error");
    Action::requeue(ADMISSION_RETRY_DELAY)
}

/// Start a controller for the LoadTest CRD.
pub async fn run(defaults: Defaults, reconcile_timeout: Duration) {
    let k_client = Client::try_default()
        .await
        .expect("should be able to create client");
    let context = Arc::new(Context::new(
        KubeClusterApi::new(k_client.clone()),
        defaults,
        reconcile_timeout,
    ));

    let load_tests: Api<LoadTest> = Api::all(k_client.clone());
    let pods = Api::<Pod>::all(k_client.clone());
    let config_maps = Api::<ConfigMap>::all(k_client.clone());

    Controller::new(load_tests, watcher::Config::default())
        .owns(pods, watcher::Config::default().labels(GENERATED_LABEL))
        .owns(
            config_maps,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .run(reconcile, on_error, context)
        .for_each(|rec_res| async move {
            match rec_res {
                Ok((test, _)) => {
                    debug!(test.name, "reconcile success");
                }
                Err(err) => {
                    error!(?err, "reconcile error")
                }
            }
        })
        .await;
}

/// Perform one reconcile pass for a LoadTest, bounded by the configured
/// reconciliation timeout.
pub async fn reconcile<A, C>(
    test: Arc<LoadTest>,
    cx: Arc<Context<A, C>>,
) -> Result<Action, Error>
where
    A: ClusterApi + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    match tokio::time::timeout(cx.reconcile_timeout, reconcile_load_test(test, cx.clone())).await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

async fn reconcile_load_test<A, C>(
    test: Arc<LoadTest>,
    cx: Arc<Context<A, C>>,
) -> Result<Action, Error>
where
    A: ClusterApi + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    let name = test.name_any();
    debug!(test = name, "reconcile");

    // Work from the freshest stored copy; a test that is gone was deleted
    // between the notification and this pass.
    let Some(stored) = cx
        .api
        .get_load_test(&test.namespace().unwrap_or_default(), &name)
        .await?
    else {
        debug!(test = name, "test no longer exists, ignoring");
        return Ok(Action::await_change());
    };

    let ttl = Duration::from_secs(stored.spec.ttl_seconds.max(0) as u64);
    let timeout = Duration::from_secs(stored.spec.timeout_seconds.max(0) as u64);
    if timeout > ttl {
        info!(test = name, ?timeout, ?ttl, "timeout is longer than the TTL, the TTL dominates");
    }

    // Terminal tests are never touched again, they only age out.
    if let Some(current) = &stored.status {
        if current.state.is_terminated() {
            if expired(current, &stored, ttl, Time(cx.clock.now())) {
                info!(test = name, ?ttl, "test expired, deleting");
                cx.api.delete_load_test(&stored).await?;
            }
            return Ok(Action::await_change());
        }
    }

    // Filling defaults is a separate transaction from scheduling: a
    // write-back returns immediately and the update notification continues.
    let mut test = stored.clone();
    if let Err(err) = cx.defaults.set_load_test_defaults(&mut test) {
        return fail_test(
            &cx,
            &test,
            UserError {
                reason: FAILED_SETTING_DEFAULTS_ERROR,
                message: format!("failed to set defaults for missing fields on the test: {err}"),
            },
        )
        .await;
    }
    if test != stored {
        cx.api.update_load_test(&test).await?;
        return Ok(Action::await_change());
    }

    let namespace = test.namespace().unwrap_or_default();
    ensure_scenarios_config_map(&cx, &test, &namespace).await?;

    let pods = cx.api.list_pods(&namespace).await?;
    let owned = status::pods_for_load_test(&test, &pods);

    let previous_status = test.status.clone().unwrap_or_default();
    let new_status = status::for_load_test(&test, &owned, Time(cx.clock.now()));
    test.status = Some(new_status.clone());
    cx.api.update_load_test_status(&test).await?;

    let mut missing = status::check_missing_pods(&test, &owned);
    if !missing.is_empty() {
        if !cx.api.cache_synced().await {
            return Err(Error::CacheSync);
        }

        let nodes = cx.api.list_nodes().await?;
        let cluster_info =
            ClusterInfo::current(&nodes, &pods, cx.defaults.default_pool_labels.as_ref());
        cluster_info.adjust_for_default_pools(&mut missing);

        // Admission is all-or-nothing per test to preserve the gang
        // property: either every missing pod fits or none is created.
        for (pool, required) in &missing.node_count_by_pool {
            let Some(available) = cluster_info.availability_for_pool(pool) else {
                error!(
                    test = name,
                    requested_pool = pool,
                    "requested pool does not exist and cannot be considered when scheduling"
                );
                return fail_test(
                    &cx,
                    &test,
                    UserError {
                        reason: POOL_ERROR,
                        message: format!("requested pool {pool:?} does not exist"),
                    },
                )
                .await;
            };
            if *required > available {
                info!(
                    test = name,
                    pool,
                    required,
                    available,
                    "cannot schedule test: inadequate availability for pool"
                );
                return Ok(Action::requeue(ADMISSION_RETRY_DELAY));
            }
        }

        // Creation is ordered: servers first so clients have an endpoint,
        // the driver last so it observes a complete deployment.
        let builder = PodBuilder::new(&cx.defaults, &test);
        for server in &missing.servers {
            let built = builder.pod_for_server(server);
            if let Some(action) = create_worker_pod(
                &cx,
                &test,
                &cluster_info,
                Role::Server,
                &server.component,
                built,
                &namespace,
            )
            .await?
            {
                return Ok(action);
            }
        }
        for client in &missing.clients {
            let built = builder.pod_for_client(client);
            if let Some(action) = create_worker_pod(
                &cx,
                &test,
                &cluster_info,
                Role::Client,
                &client.component,
                built,
                &namespace,
            )
            .await?
            {
                return Ok(action);
            }
        }
        if let Some(driver) = &missing.driver {
            let built = builder.pod_for_driver(driver);
            if let Some(action) = create_worker_pod(
                &cx,
                &test,
                &cluster_info,
                Role::Driver,
                &driver.component,
                built,
                &namespace,
            )
            .await?
            {
                return Ok(action);
            }
        }
    }

    Ok(requeue_action(&previous_status, &new_status, &test))
}

// Stamp the resolved pool and owner reference on a pod and create it.
// AlreadyExists means another invocation raced us and is treated as
// success. Ok(Some(action)) stops the creation loop for this cycle.
#[allow(clippy::too_many_arguments)]
async fn create_worker_pod<A, C>(
    cx: &Context<A, C>,
    test: &LoadTest,
    cluster_info: &ClusterInfo,
    role: Role,
    component: &Component,
    built: Result<Pod, crate::loadtest::pod::PodBuildError>,
    namespace: &str,
) -> Result<Option<Action>, Error>
where
    A: ClusterApi + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    let mut pod = match built {
        Ok(pod) => pod,
        Err(err) => {
            let action = fail_test(
                cx,
                test,
                UserError {
                    reason: CONFIGURATION_ERROR,
                    message: format!(
                        "failed to construct a pod for {role} {:?}: {err}",
                        component.name.as_deref().unwrap_or_default()
                    ),
                },
            )
            .await?;
            return Ok(Some(action));
        }
    };

    let pool = match (&component.pool, cluster_info.default_pool_for_role(role)) {
        (Some(pool), _) => pool.clone(),
        (None, Some(default_pool)) => default_pool.to_owned(),
        (None, None) => {
            let action = fail_test(
                cx,
                test,
                UserError {
                    reason: POOL_ERROR,
                    message: format!("no pool known for {role} {:?}", component.name),
                },
            )
            .await?;
            return Ok(Some(action));
        }
    };
    pod.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(POOL_LABEL.to_owned(), pool.clone());
    if let Some(spec) = pod.spec.as_mut() {
        spec.node_selector
            .get_or_insert_with(Default::default)
            .insert(POOL_LABEL.to_owned(), pool);
    }

    let Some(owner_ref) = (cx.owner_ref)(test) else {
        // Without the reference the pod would never be garbage collected.
        return Err(anyhow!("could not set controller reference on pod").into());
    };
    pod.metadata.owner_references = Some(vec![owner_ref]);

    match cx.api.create_pod(namespace, &pod).await {
        Ok(_) => Ok(None),
        Err(err) if is_already_exists(&err) => Ok(None),
        Err(err) => {
            error!(
                test = test.name_any(),
                pod = pod.name_any(),
                %err,
                "could not create new pod"
            );
            fail_test(
                cx,
                test,
                UserError {
                    reason: KUBERNETES_ERROR,
                    message: format!(
                        "failed to create pod for {role} {:?}: {err}",
                        component.name.as_deref().unwrap_or_default()
                    ),
                },
            )
            .await?;
            Err(err.into())
        }
    }
}

// Record a user error on the test status. User errors are not retried: the
// test stays in place for inspection until its TTL expires.
async fn fail_test<A, C>(
    cx: &Context<A, C>,
    test: &LoadTest,
    user_error: UserError,
) -> Result<Action, Error>
where
    A: ClusterApi + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    error!(
        test = test.name_any(),
        reason = user_error.reason,
        message = %user_error.message,
        "test failed with a user error"
    );
    let mut failed = test.clone();
    let mut status = failed.status.clone().unwrap_or_default();
    status.state = LoadTestState::Errored;
    status.reason = user_error.reason.to_owned();
    status.message = user_error.message;
    failed.status = Some(status);
    cx.api.update_load_test_status(&failed).await?;
    Ok(Action::await_change())
}

async fn ensure_scenarios_config_map<A, C>(
    cx: &Context<A, C>,
    test: &LoadTest,
    namespace: &str,
) -> Result<(), Error>
where
    A: ClusterApi + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    let name = test.name_any();
    if cx.api.get_config_map(namespace, &name).await?.is_some() {
        return Ok(());
    }

    let Some(owner_ref) = (cx.owner_ref)(test) else {
        // Without the reference the map would outlive the test and shadow a
        // later test with the same name.
        return Err(anyhow!("could not set owner reference on scenarios ConfigMap").into());
    };
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_owned()),
            owner_references: Some(vec![owner_ref]),
            labels: managed_labels(),
            ..Default::default()
        },
        data: Some(BTreeMap::from_iter(vec![(
            SCENARIOS_KEY.to_owned(),
            test.spec.scenarios_json.clone(),
        )])),
        ..Default::default()
    };
    match cx.api.create_config_map(namespace, &config_map).await {
        Ok(_) => Ok(()),
        Err(err) if is_already_exists(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

// Whether a terminal test has outlived its TTL, measured from its start
// time, falling back to its creation time for tests that never started.
fn expired(status: &LoadTestStatus, test: &LoadTest, ttl: Duration, now: Time) -> bool {
    let reference = status
        .start_time
        .as_ref()
        .or(test.metadata.creation_timestamp.as_ref());
    match reference {
        Some(start) => {
            now.0.signed_duration_since(start.0).to_std().unwrap_or_default() >= ttl
        }
        None => false,
    }
}

// Requeue when a deadline has just started ticking: the timeout once the
// test starts, the remaining TTL once it stops. Otherwise rely on watches.
fn requeue_action(previous: &LoadTestStatus, current: &LoadTestStatus, test: &LoadTest) -> Action {
    if previous.start_time.is_none() && current.start_time.is_some() {
        return Action::requeue(Duration::from_secs(test.spec.timeout_seconds.max(0) as u64));
    }

    if previous.stop_time.is_none() && current.stop_time.is_some() {
        let ttl = Duration::from_secs(test.spec.ttl_seconds.max(0) as u64);
        let run_time = match (&current.start_time, &current.stop_time) {
            (Some(start), Some(stop)) => stop
                .0
                .signed_duration_since(start.0)
                .to_std()
                .unwrap_or_default(),
            _ => Duration::ZERO,
        };
        return Action::requeue(ttl.saturating_sub(run_time));
    }

    Action::await_change()
}
