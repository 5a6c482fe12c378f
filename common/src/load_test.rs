//! The LoadTest custom resource and its spec, status and state types.
//!
//! These types are shared between the operator, which reconciles LoadTests
//! into worker pods, and the runner, which submits LoadTests and polls
//! their status.
use k8s_openapi::{
    api::core::v1::{EnvVar, VolumeMount},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reason tag set when a required language to image mapping is absent.
pub const FAILED_SETTING_DEFAULTS_ERROR: &str = "FailedSettingDefaultsError";
/// Reason tag set when a pod spec cannot be constructed from a component.
pub const CONFIGURATION_ERROR: &str = "ConfigurationError";
/// Reason tag set when a test requests a pool that does not exist.
pub const POOL_ERROR: &str = "PoolError";
/// Reason tag set when the orchestrator rejects a pod create.
pub const KUBERNETES_ERROR: &str = "KubernetesError";
/// Reason tag set when a running test outlives its timeout.
pub const TIMEOUT_ERRORED: &str = "TimeoutErrored";

/// Primary CRD describing one benchmark run as a set of worker components.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "gantry.dev",
    version = "v1",
    kind = "LoadTest",
    plural = "loadtests",
    status = "LoadTestStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestSpec {
    /// The component that orchestrates the test, polling workers over the
    /// driver port. Allocated by the operator when unset.
    pub driver: Option<Driver>,
    /// Server components, in order.
    #[serde(default)]
    pub servers: Vec<Server>,
    /// Client components, in order.
    #[serde(default)]
    pub clients: Vec<Client>,
    /// Where results should be sent after the test terminates.
    pub results: Option<Results>,
    /// Scenario definitions handed to the driver as a JSON blob.
    #[serde(default, rename = "scenariosJSON")]
    pub scenarios_json: String,
    /// Named scenarios. Only the first is used.
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    /// Number of seconds a test may run before it is marked errored.
    pub timeout_seconds: i32,
    /// Number of seconds a test lives, measured from its start time,
    /// before it is deleted.
    pub ttl_seconds: i32,
}

/// A named scenario.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    /// Name of the scenario.
    pub name: String,
}

/// Where the results of the test should be stored.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Results {
    /// BigQuery table where results should be written.
    pub big_query_table: Option<String>,
}

/// The common shape of a client, server or driver.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Name of the component, unique within its role. Defaulted when unset.
    pub name: Option<String>,
    /// Language the component is written in, used to infer build and run
    /// images.
    #[serde(default)]
    pub language: String,
    /// Node pool where the component's pod should be scheduled. When unset
    /// the operator picks the configured or cluster default pool for the
    /// component's role.
    pub pool: Option<String>,
    /// Optional init step that clones a git repository into the workspace.
    pub clone: Option<Clone>,
    /// Optional init step that builds the cloned sources.
    pub build: Option<Build>,
    /// The main container of the component's pod.
    #[serde(default)]
    pub run: Run,
}

/// Driver component wrapper.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct Driver {
    /// The component that runs as the driver.
    #[serde(flatten)]
    pub component: Component,
}

/// Server component wrapper.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct Server {
    /// The component that runs as a server.
    #[serde(flatten)]
    pub component: Component,
}

/// Client component wrapper.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct Client {
    /// The component that runs as a client.
    #[serde(flatten)]
    pub component: Component,
}

/// Defines a git clone init step.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Clone {
    /// Image of the clone container. Defaulted when unset.
    pub image: Option<String>,
    /// Repository to clone.
    pub repo: Option<String>,
    /// Branch, tag or commit to check out.
    pub git_ref: Option<String>,
}

/// Defines a build init step.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    /// Image of the build container. Inferred from the component language
    /// when unset.
    pub image: Option<String>,
    /// Command run by the build container.
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments passed to the build command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment for the build container.
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Defines the main container of a component's pod.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Image of the run container. Inferred from the component language
    /// when unset.
    pub image: Option<String>,
    /// Command run by the container.
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment for the container.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Extra volume mounts for the container.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Observed state of a LoadTest, derived from its owned pods.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadTestStatus {
    /// Current state of the test.
    pub state: LoadTestState,
    /// Machine-readable tag explaining an errored state. Reason strings are
    /// part of the API and safe to compare against.
    pub reason: String,
    /// Human-readable explanation of the current state.
    pub message: String,
    /// Time of the first observation that all workers were running.
    pub start_time: Option<Time>,
    /// Time of the first observation that the test had terminated.
    pub stop_time: Option<Time>,
}

/// The discrete set of states a LoadTest moves through.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum LoadTestState {
    /// State could not be determined.
    #[default]
    Unknown,
    /// No worker pods exist yet.
    Pending,
    /// Some, but not all, worker pods exist.
    Provisioning,
    /// Every worker pod has a running container.
    Running,
    /// Every worker pod terminated successfully.
    Succeeded,
    /// The test failed; see the reason and message for details.
    Errored,
}

impl LoadTestState {
    /// True once the state can no longer change, deletion aside.
    pub fn is_terminated(&self) -> bool {
        matches!(self, LoadTestState::Succeeded | LoadTestState::Errored)
    }
}

impl std::fmt::Display for LoadTestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoadTestState::Unknown => "Unknown",
            LoadTestState::Pending => "Pending",
            LoadTestState::Provisioning => "Provisioning",
            LoadTestState::Running => "Running",
            LoadTestState::Succeeded => "Succeeded",
            LoadTestState::Errored => "Errored",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(LoadTestState::Succeeded.is_terminated());
        assert!(LoadTestState::Errored.is_terminated());
        for state in [
            LoadTestState::Unknown,
            LoadTestState::Pending,
            LoadTestState::Provisioning,
            LoadTestState::Running,
        ] {
            assert!(!state.is_terminated());
        }
    }

    #[test]
    fn spec_round_trips_through_yaml() {
        let test = LoadTest::new(
            "round-trip",
            LoadTestSpec {
                servers: vec![Server {
                    component: Component {
                        name: Some("server-0".to_owned()),
                        language: "cxx".to_owned(),
                        ..Default::default()
                    },
                }],
                clients: vec![Client {
                    component: Component {
                        name: Some("client-0".to_owned()),
                        language: "cxx".to_owned(),
                        ..Default::default()
                    },
                }],
                scenarios_json: "{\"scenarios\": []}".to_owned(),
                timeout_seconds: 300,
                ttl_seconds: 600,
                ..Default::default()
            },
        );
        let encoded = serde_json::to_string(&test).expect("spec should serialize");
        let decoded: LoadTest = serde_json::from_str(&encoded).expect("spec should deserialize");
        assert_eq!(test.spec, decoded.spec);
    }

    #[test]
    fn component_fields_flatten() {
        let json = r#"{"name": "main", "language": "go", "run": {"image": "golang"}}"#;
        let driver: Driver = serde_json::from_str(json).expect("driver should deserialize");
        assert_eq!(driver.component.name.as_deref(), Some("main"));
        assert_eq!(driver.component.language, "go");
        assert_eq!(driver.component.run.image.as_deref(), Some("golang"));
    }
}
