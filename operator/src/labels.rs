use std::collections::BTreeMap;

/// Label carrying the name of the owning load test on every worker pod.
pub const LOAD_TEST_LABEL: &str = "loadtest";
/// Label carrying the role of a worker pod within its test.
pub const ROLE_LABEL: &str = "loadtest-role";
/// Label carrying the component name of a worker pod within its role.
pub const COMPONENT_LABEL: &str = "loadtest-component";
/// Label carrying the node pool a pod was dispatched to. Nodes carry the
/// same label to declare pool membership.
pub const POOL_LABEL: &str = "pool";
/// Presence label stamped on every generated pod. The pod anti-affinity
/// rule keys on it so that at most one benchmark pod lands per node.
pub const GENERATED_LABEL: &str = "generated";

/// The function of a component's pod within a load test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// Issues benchmark traffic.
    Client,
    /// Orchestrates clients and servers and collects results.
    Driver,
    /// Receives benchmark traffic.
    Server,
}

impl Role {
    /// The label value for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Driver => "driver",
            Role::Server => "server",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manage by label
pub const MANAGED_BY_LABEL_SELECTOR: &str = "managed-by=gantry";

/// Labels that indicate the resource is managed by the gantry operator.
pub fn managed_labels() -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "managed-by".to_owned(),
        "gantry".to_owned(),
    )]))
}
