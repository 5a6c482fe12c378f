//! Derives a LoadTest status from the pods the test owns.
//!
//! Status is a pure function of the spec and the observed pods, so a lost
//! notification can only delay convergence, never corrupt state.
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use gantry_common::load_test::{
    Client, Driver, LoadTest, LoadTestState, LoadTestStatus, Server, TIMEOUT_ERRORED,
};
use k8s_openapi::{
    api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Time, chrono::Duration,
};
use kube::ResourceExt;

use crate::labels::{Role, COMPONENT_LABEL, LOAD_TEST_LABEL, ROLE_LABEL};

/// Placeholder pool key for missing clients whose pool is unset.
pub const DEFAULT_CLIENT_POOL: &str = "default-client-pool";
/// Placeholder pool key for missing drivers whose pool is unset.
pub const DEFAULT_DRIVER_POOL: &str = "default-driver-pool";
/// Placeholder pool key for missing servers whose pool is unset.
pub const DEFAULT_SERVER_POOL: &str = "default-server-pool";

/// The placeholder pool key for components of a role that have no pool of
/// their own. Admission maps these onto the pool discovered in the cluster
/// snapshot.
pub fn default_pool_key(role: Role) -> &'static str {
    match role {
        Role::Client => DEFAULT_CLIENT_POOL,
        Role::Driver => DEFAULT_DRIVER_POOL,
        Role::Server => DEFAULT_SERVER_POOL,
    }
}

/// The components of a LoadTest that do not yet have an owned pod, plus the
/// node count the remainder requires from each pool.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoadTestMissing {
    /// Missing servers, in spec order.
    pub servers: Vec<Server>,
    /// Missing clients, in spec order.
    pub clients: Vec<Client>,
    /// The missing driver, if any.
    pub driver: Option<Driver>,
    /// Nodes required per pool to schedule the missing components.
    pub node_count_by_pool: BTreeMap<String, i32>,
}

impl LoadTestMissing {
    /// True when every component already has a pod.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.clients.is_empty() && self.driver.is_none()
    }
}

/// Filter a pod list down to the pods owned by the given test, matching on
/// the loadtest label.
pub fn pods_for_load_test<'a>(test: &LoadTest, pods: &'a [Pod]) -> Vec<&'a Pod> {
    let name = test.name_any();
    pods.iter()
        .filter(|pod| {
            pod.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LOAD_TEST_LABEL))
                == Some(&name)
        })
        .collect()
}

/// Determine which components of the test's spec have no owned pod yet.
/// Matching is by the role and component-name labels.
pub fn check_missing_pods(test: &LoadTest, owned: &[&Pod]) -> LoadTestMissing {
    let mut missing = LoadTestMissing::default();

    let existing: BTreeSet<(String, String)> = owned
        .iter()
        .filter_map(|pod| {
            let labels = pod.metadata.labels.as_ref()?;
            Some((
                labels.get(ROLE_LABEL)?.clone(),
                labels.get(COMPONENT_LABEL)?.clone(),
            ))
        })
        .collect();

    let mut require_node = |pool: Option<&String>, role: Role| {
        let key = pool
            .map(String::as_str)
            .unwrap_or_else(|| default_pool_key(role));
        *missing.node_count_by_pool.entry(key.to_owned()).or_insert(0) += 1;
    };

    for server in &test.spec.servers {
        if !component_exists(&existing, Role::Server, server.component.name.as_deref()) {
            require_node(server.component.pool.as_ref(), Role::Server);
            missing.servers.push(server.clone());
        }
    }
    for client in &test.spec.clients {
        if !component_exists(&existing, Role::Client, client.component.name.as_deref()) {
            require_node(client.component.pool.as_ref(), Role::Client);
            missing.clients.push(client.clone());
        }
    }
    if let Some(driver) = &test.spec.driver {
        if !component_exists(&existing, Role::Driver, driver.component.name.as_deref()) {
            require_node(driver.component.pool.as_ref(), Role::Driver);
            missing.driver = Some(driver.clone());
        }
    }

    missing
}

fn component_exists(
    existing: &BTreeSet<(String, String)>,
    role: Role,
    name: Option<&str>,
) -> bool {
    match name {
        Some(name) => existing.contains(&(role.as_str().to_owned(), name.to_owned())),
        // A nameless component can never match a pod; defaulting prevents this.
        None => false,
    }
}

/// Fold the test spec and its owned pods into a status.
///
/// Terminal states are sticky. Start and stop times are stamped the first
/// time the relevant observation is made and never changed afterwards.
pub fn for_load_test(test: &LoadTest, owned: &[&Pod], now: Time) -> LoadTestStatus {
    let mut status = test.status.clone().unwrap_or_default();
    if status.state.is_terminated() {
        return status;
    }

    for pod in owned {
        if let Some((container, exit_code)) = failed_container(pod) {
            status.state = LoadTestState::Errored;
            status.message = format!(
                "container {container:?} in pod {:?} terminated with exit code {exit_code}",
                pod.name_any()
            );
            if status.stop_time.is_none() {
                status.stop_time = Some(now.clone());
            }
            return status;
        }
    }

    if let Some(start_time) = &status.start_time {
        let elapsed = now.0.signed_duration_since(start_time.0);
        if elapsed >= Duration::seconds(test.spec.timeout_seconds as i64) {
            status.state = LoadTestState::Errored;
            status.reason = TIMEOUT_ERRORED.to_owned();
            status.message = format!(
                "test has run longer than its timeout of {} seconds",
                test.spec.timeout_seconds
            );
            if status.stop_time.is_none() {
                status.stop_time = Some(now.clone());
            }
            return status;
        }
    }

    let missing = check_missing_pods(test, owned);
    if !missing.is_empty() {
        status.state = if owned.is_empty() {
            LoadTestState::Pending
        } else {
            LoadTestState::Provisioning
        };
        return status;
    }

    if owned.iter().all(|pod| has_succeeded_container(pod)) {
        status.state = LoadTestState::Succeeded;
        if status.stop_time.is_none() {
            status.stop_time = Some(now);
        }
        return status;
    }

    if owned.iter().all(|pod| has_running_container(pod)) {
        status.state = LoadTestState::Running;
        if status.start_time.is_none() {
            status.start_time = Some(now);
        }
        return status;
    }

    status
}

// The name and exit code of the first container observed to have
// terminated unsuccessfully.
fn failed_container(pod: &Pod) -> Option<(String, i32)> {
    container_statuses(pod).find_map(|cs| {
        let terminated = cs.state.as_ref()?.terminated.as_ref()?;
        (terminated.exit_code != 0).then(|| (cs.name.clone(), terminated.exit_code))
    })
}

fn has_succeeded_container(pod: &Pod) -> bool {
    container_statuses(pod).any(|cs| {
        cs.state
            .as_ref()
            .and_then(|state| state.terminated.as_ref())
            .map(|terminated| terminated.exit_code == 0)
            .unwrap_or(false)
    })
}

fn has_running_container(pod: &Pod) -> bool {
    container_statuses(pod)
        .any(|cs| cs.state.as_ref().map(|s| s.running.is_some()).unwrap_or(false))
}

fn container_statuses(
    pod: &Pod,
) -> impl Iterator<Item = &k8s_openapi::api::core::v1::ContainerStatus> {
    pod.status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
}
