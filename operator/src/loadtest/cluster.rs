//! A point-in-time view of the cluster used for admission decisions.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tracing::info;

use crate::defaults::PoolLabelMap;
use crate::labels::{Role, POOL_LABEL};
use crate::loadtest::status::{default_pool_key, LoadTestMissing};

/// Node pool capacity, availability and per-role default pools, aggregated
/// from the node and pod lists at one instant.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClusterInfo {
    // Total nodes per pool label.
    capacity: BTreeMap<String, i32>,
    // Nodes per pool not occupied by a non-terminal pod.
    availability: BTreeMap<String, i32>,
    // Default pool per role, from the first node bearing the role's
    // default-pool label.
    default_pools: BTreeMap<Role, String>,
}

impl ClusterInfo {
    /// Aggregate the node and pod lists into a snapshot.
    ///
    /// Nodes without a pool label are logged and skipped. Pods whose phase
    /// is Succeeded or Failed no longer occupy a node, which is what allows
    /// a pool to be reused once a prior test has finished.
    pub fn current(nodes: &[Node], pods: &[Pod], default_pool_labels: Option<&PoolLabelMap>) -> Self {
        let mut info = ClusterInfo::default();

        for node in nodes {
            let labels = node.metadata.labels.clone().unwrap_or_default();
            let Some(pool) = labels.get(POOL_LABEL) else {
                info!(node = node.name_any(), "encountered a node without a pool label");
                continue;
            };

            if let Some(pool_labels) = default_pool_labels {
                for (role, default_label) in [
                    (Role::Client, &pool_labels.client),
                    (Role::Driver, &pool_labels.driver),
                    (Role::Server, &pool_labels.server),
                ] {
                    if !info.default_pools.contains_key(&role)
                        && labels.contains_key(default_label)
                    {
                        info.default_pools.insert(role, pool.clone());
                    }
                }
            }

            *info.capacity.entry(pool.clone()).or_insert(0) += 1;
        }

        info.availability = info.capacity.clone();
        for pod in pods {
            let Some(pool) = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(POOL_LABEL))
            else {
                continue;
            };
            let phase = pod
                .status
                .as_ref()
                .and_then(|status| status.phase.as_deref())
                .unwrap_or_default();
            if phase != "Succeeded" && phase != "Failed" {
                if let Some(available) = info.availability.get_mut(pool) {
                    *available -= 1;
                }
            }
        }

        info
    }

    /// Total nodes bearing the pool label, or None if no node does.
    pub fn capacity_for_pool(&self, pool: &str) -> Option<i32> {
        self.capacity.get(pool).copied()
    }

    /// Nodes in the pool not occupied by a non-terminal pod, or None if the
    /// pool does not exist.
    pub fn availability_for_pool(&self, pool: &str) -> Option<i32> {
        self.availability.get(pool).copied()
    }

    /// The default pool for a role, if any node declared one.
    pub fn default_pool_for_role(&self, role: Role) -> Option<&str> {
        self.default_pools.get(&role).map(String::as_str)
    }

    /// Fold placeholder default-pool counts in the missing set onto the
    /// concrete pools discovered in this snapshot. A role with a
    /// placeholder count but no discovered default pool is left as is;
    /// the per-pool existence check then rejects the test. Other roles
    /// are still adjusted.
    pub fn adjust_for_default_pools(&self, missing: &mut LoadTestMissing) {
        for role in [Role::Client, Role::Driver, Role::Server] {
            let Some(default_pool) = self.default_pool_for_role(role) else {
                continue;
            };
            let key = default_pool_key(role);
            let Some(count) = missing.node_count_by_pool.remove(key) else {
                continue;
            };
            *missing
                .node_count_by_pool
                .entry(default_pool.to_owned())
                .or_insert(0) += count;
        }
    }
}
