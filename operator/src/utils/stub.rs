//! Helper doubles only available for tests
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use gantry_common::load_test::LoadTest;
use k8s_openapi::{
    api::core::v1::{ConfigMap, Node, Pod},
    chrono::{DateTime, TimeZone, Utc},
};
use kube::{error::ErrorResponse, ResourceExt};

use crate::defaults::Defaults;
use crate::utils::{controller_owner_ref, Clock, ClusterApi, Context};

/// A clock pinned to a fixed instant.
pub struct StaticClock(pub DateTime<Utc>);

impl Clock for StaticClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A time for tests, seconds past the epoch.
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).unwrap()
}

/// In-memory ClusterApi. Pods, tests and config maps live in maps guarded
/// by mutexes; nodes are fixed at construction.
#[derive(Default)]
pub struct FakeCluster {
    pub tests: Mutex<BTreeMap<String, LoadTest>>,
    pub config_maps: Mutex<BTreeMap<String, ConfigMap>>,
    pub pods: Mutex<Vec<Pod>>,
    pub nodes: Vec<Node>,
    pub deleted_tests: Mutex<Vec<String>>,
    pub synced: bool,
    /// When set, pod creates fail with this apiserver reason.
    pub fail_pod_create: Option<String>,
}

impl FakeCluster {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            synced: true,
            ..Default::default()
        }
    }

    pub fn with_pods(self, pods: Vec<Pod>) -> Self {
        *self.pods.lock().unwrap() = pods;
        self
    }

    pub fn insert_test(&self, test: &LoadTest) {
        self.tests
            .lock()
            .unwrap()
            .insert(test.name_any(), test.clone());
    }

    pub fn stored_test(&self, name: &str) -> Option<LoadTest> {
        self.tests.lock().unwrap().get(name).cloned()
    }

    pub fn pods_snapshot(&self) -> Vec<Pod> {
        self.pods.lock().unwrap().clone()
    }

    fn api_error(reason: &str, code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: reason.to_owned(),
            reason: reason.to_owned(),
            code,
        })
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_load_test(&self, _ns: &str, name: &str) -> kube::Result<Option<LoadTest>> {
        Ok(self.tests.lock().unwrap().get(name).cloned())
    }

    async fn update_load_test(&self, test: &LoadTest) -> kube::Result<LoadTest> {
        self.tests
            .lock()
            .unwrap()
            .insert(test.name_any(), test.clone());
        Ok(test.clone())
    }

    async fn update_load_test_status(&self, test: &LoadTest) -> kube::Result<LoadTest> {
        let mut tests = self.tests.lock().unwrap();
        let entry = tests.entry(test.name_any()).or_insert_with(|| test.clone());
        entry.status = test.status.clone();
        Ok(entry.clone())
    }

    async fn delete_load_test(&self, test: &LoadTest) -> kube::Result<()> {
        let name = test.name_any();
        self.tests.lock().unwrap().remove(&name);
        self.deleted_tests.lock().unwrap().push(name);
        Ok(())
    }

    async fn get_config_map(&self, _ns: &str, name: &str) -> kube::Result<Option<ConfigMap>> {
        Ok(self.config_maps.lock().unwrap().get(name).cloned())
    }

    async fn create_config_map(
        &self,
        _ns: &str,
        config_map: &ConfigMap,
    ) -> kube::Result<ConfigMap> {
        let name = config_map.name_any();
        let mut config_maps = self.config_maps.lock().unwrap();
        if config_maps.contains_key(&name) {
            return Err(Self::api_error("AlreadyExists", 409));
        }
        config_maps.insert(name, config_map.clone());
        Ok(config_map.clone())
    }

    async fn list_pods(&self, _ns: &str) -> kube::Result<Vec<Pod>> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn list_nodes(&self) -> kube::Result<Vec<Node>> {
        Ok(self.nodes.clone())
    }

    async fn create_pod(&self, _ns: &str, pod: &Pod) -> kube::Result<Pod> {
        if let Some(reason) = &self.fail_pod_create {
            return Err(Self::api_error(reason, 500));
        }
        let mut pods = self.pods.lock().unwrap();
        if pods.iter().any(|existing| existing.name_any() == pod.name_any()) {
            return Err(Self::api_error("AlreadyExists", 409));
        }
        pods.push(pod.clone());
        Ok(pod.clone())
    }

    async fn cache_synced(&self) -> bool {
        self.synced
    }
}

impl<A> Context<A, StaticClock> {
    /// Create a test context with a fixed clock.
    pub fn test(api: A, defaults: Defaults, now: DateTime<Utc>) -> Self {
        Context {
            api,
            defaults,
            reconcile_timeout: Duration::from_secs(1),
            clock: StaticClock(now),
            owner_ref: controller_owner_ref,
        }
    }
}
