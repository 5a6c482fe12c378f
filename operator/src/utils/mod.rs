//! Utils is the shared context and orchestrator client seam for the controller
#[cfg(test)]
pub mod stub;

use std::time::Duration;

use async_trait::async_trait;
use gantry_common::load_test::LoadTest;
use k8s_openapi::{
    api::core::v1::{ConfigMap, Node, Pod},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    chrono::{DateTime, Utc},
};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    client::Client,
    Api, Resource, ResourceExt,
};

use crate::defaults::Defaults;

/// Provides the current time.
pub trait Clock {
    /// Report the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Provides the current time using real time.
pub struct UtcClock;
impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The narrow view of the orchestrator the controller consumes. Production
/// code talks to the apiserver through [`KubeClusterApi`]; tests supply an
/// in-memory implementation.
#[async_trait]
pub trait ClusterApi {
    /// Fetch a LoadTest, or None when it does not exist.
    async fn get_load_test(&self, ns: &str, name: &str) -> kube::Result<Option<LoadTest>>;
    /// Replace a LoadTest's spec and metadata.
    async fn update_load_test(&self, test: &LoadTest) -> kube::Result<LoadTest>;
    /// Write back a LoadTest's status subresource.
    async fn update_load_test_status(&self, test: &LoadTest) -> kube::Result<LoadTest>;
    /// Delete a LoadTest. Missing tests are not an error.
    async fn delete_load_test(&self, test: &LoadTest) -> kube::Result<()>;
    /// Fetch a ConfigMap, or None when it does not exist.
    async fn get_config_map(&self, ns: &str, name: &str) -> kube::Result<Option<ConfigMap>>;
    /// Create a ConfigMap.
    async fn create_config_map(&self, ns: &str, config_map: &ConfigMap)
        -> kube::Result<ConfigMap>;
    /// List every pod in a namespace.
    async fn list_pods(&self, ns: &str) -> kube::Result<Vec<Pod>>;
    /// List every node in the cluster.
    async fn list_nodes(&self) -> kube::Result<Vec<Node>>;
    /// Create a pod.
    async fn create_pod(&self, ns: &str, pod: &Pod) -> kube::Result<Pod>;
    /// Whether locally observed state has caught up with the apiserver.
    /// Gang scheduling must not run against a stale view.
    async fn cache_synced(&self) -> bool;
}

/// ClusterApi implementation backed by the apiserver.
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Create a cluster api over the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn tests(&self, ns: &str) -> Api<LoadTest> {
        Api::namespaced(self.client.clone(), ns)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_load_test(&self, ns: &str, name: &str) -> kube::Result<Option<LoadTest>> {
        self.tests(ns).get_opt(name).await
    }

    async fn update_load_test(&self, test: &LoadTest) -> kube::Result<LoadTest> {
        let ns = test.namespace().unwrap_or_default();
        self.tests(&ns)
            .replace(&test.name_any(), &PostParams::default(), test)
            .await
    }

    async fn update_load_test_status(&self, test: &LoadTest) -> kube::Result<LoadTest> {
        let ns = test.namespace().unwrap_or_default();
        self.tests(&ns)
            .patch_status(
                &test.name_any(),
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "status": test.status })),
            )
            .await
    }

    async fn delete_load_test(&self, test: &LoadTest) -> kube::Result<()> {
        let ns = test.namespace().unwrap_or_default();
        match self
            .tests(&ns)
            .delete(&test.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_config_map(&self, ns: &str, name: &str) -> kube::Result<Option<ConfigMap>> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        config_maps.get_opt(name).await
    }

    async fn create_config_map(
        &self,
        ns: &str,
        config_map: &ConfigMap,
    ) -> kube::Result<ConfigMap> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        config_maps.create(&PostParams::default(), config_map).await
    }

    async fn list_pods(&self, ns: &str) -> kube::Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        Ok(pods.list(&Default::default()).await?.items)
    }

    async fn list_nodes(&self) -> kube::Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&Default::default()).await?.items)
    }

    async fn create_pod(&self, ns: &str, pod: &Pod) -> kube::Result<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        pods.create(&PostParams::default(), pod).await
    }

    async fn cache_synced(&self) -> bool {
        // Lists go straight to the apiserver rather than a local store, so
        // every read observes the latest committed state.
        true
    }
}

/// Produces the owner reference stamped on resources the controller creates.
/// Held as a field so tests can inject a failing setter locally instead of
/// mutating process-wide state.
pub type OwnerRefFn = fn(&LoadTest) -> Option<OwnerReference>;

/// The default owner reference setter: the test controller-owns the resource.
pub fn controller_owner_ref(test: &LoadTest) -> Option<OwnerReference> {
    test.controller_owner_ref(&())
}

/// Operator Context
pub struct Context<A, C> {
    /// Orchestrator client
    pub api: A,
    /// Defaults applied to tests before scheduling
    pub defaults: Defaults,
    /// Near-maximum duration of one reconcile invocation
    pub reconcile_timeout: Duration,
    /// Clock that provides the current time
    pub clock: C,
    /// Owner reference setter for created resources
    pub owner_ref: OwnerRefFn,
}

impl<A> Context<A, UtcClock> {
    /// Create a new context over the real clock.
    pub fn new(api: A, defaults: Defaults, reconcile_timeout: Duration) -> Self {
        Context {
            api,
            defaults,
            reconcile_timeout,
            clock: UtcClock,
            owner_ref: controller_owner_ref,
        }
    }
}

/// True when the error is the apiserver rejecting a create because the
/// resource already exists.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.reason == "AlreadyExists")
}
