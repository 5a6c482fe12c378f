//! Builds worker pod specs from LoadTest components.
//!
//! Construction is a pure function of the test, the role and the component:
//! rebuilding a pod for the same inputs yields an identical spec.
use std::collections::BTreeMap;

use gantry_common::load_test::{Client, Component, Driver, LoadTest, Server};
use k8s_openapi::{
    api::core::v1::{
        Affinity, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
        Pod, PodAffinityTerm, PodAntiAffinity, PodSpec, Volume, VolumeMount,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
};
use kube::{core::ObjectMeta, ResourceExt};

use crate::defaults::Defaults;
use crate::labels::{
    Role, COMPONENT_LABEL, GENERATED_LABEL, LOAD_TEST_LABEL, POOL_LABEL, ROLE_LABEL,
};
use crate::loadtest::SCENARIOS_KEY;

/// Name of the container that clones a component's repository.
pub const CLONE_INIT_CONTAINER_NAME: &str = "clone";
/// Name of the container that builds a component's sources.
pub const BUILD_INIT_CONTAINER_NAME: &str = "build";
/// Name of the container that runs a component.
pub const RUN_CONTAINER_NAME: &str = "main";

/// Env var naming the repository a clone container fetches.
pub const CLONE_REPO_ENV: &str = "CLONE_REPO";
/// Env var naming the git ref a clone container checks out.
pub const CLONE_GIT_REF_ENV: &str = "CLONE_GIT_REF";
/// Env var pointing the driver at the mounted scenarios file.
pub const SCENARIOS_FILE_ENV: &str = "SCENARIOS_FILE";

/// Name of the shared workspace volume.
pub const WORKSPACE_VOLUME_NAME: &str = "workspace";
/// Mount path of the shared workspace volume in every container.
pub const WORKSPACE_MOUNT_PATH: &str = "/src/workspace";
/// Name of the scenarios volume mounted into driver pods.
pub const SCENARIOS_VOLUME_NAME: &str = "scenarios";
/// Mount path of the scenarios volume in driver pods.
pub const SCENARIOS_MOUNT_PATH: &str = "/src/scenarios";

/// Name of the container port drivers listen on.
pub const DRIVER_PORT_NAME: &str = "driver";
/// Name of the container port servers expose.
pub const SERVER_PORT_NAME: &str = "server";

/// Errors produced while constructing a pod spec. These are user errors:
/// the component is not complete enough to run.
#[derive(Debug, thiserror::Error)]
pub enum PodBuildError {
    /// The component has no name, which defaulting should have prevented.
    #[error("component has no name after defaulting")]
    MissingName,
    /// The component has no run image, which defaulting should have
    /// prevented for known languages.
    #[error("component {component:?} has no run image after defaulting")]
    MissingRunImage {
        /// Name of the incomplete component.
        component: String,
    },
}

/// Builds pods for the components of one LoadTest.
pub struct PodBuilder<'a> {
    defaults: &'a Defaults,
    test: &'a LoadTest,
}

impl<'a> PodBuilder<'a> {
    /// Create a builder for the given test.
    pub fn new(defaults: &'a Defaults, test: &'a LoadTest) -> Self {
        Self { defaults, test }
    }

    /// Build the pod for a server component.
    pub fn pod_for_server(&self, server: &Server) -> Result<Pod, PodBuildError> {
        self.pod_for_component(Role::Server, &server.component)
    }

    /// Build the pod for a client component.
    pub fn pod_for_client(&self, client: &Client) -> Result<Pod, PodBuildError> {
        self.pod_for_component(Role::Client, &client.component)
    }

    /// Build the pod for the driver component.
    pub fn pod_for_driver(&self, driver: &Driver) -> Result<Pod, PodBuildError> {
        self.pod_for_component(Role::Driver, &driver.component)
    }

    fn pod_for_component(&self, role: Role, component: &Component) -> Result<Pod, PodBuildError> {
        let test_name = self.test.name_any();
        let component_name = component.name.clone().ok_or(PodBuildError::MissingName)?;
        let run_image =
            component
                .run
                .image
                .clone()
                .ok_or_else(|| PodBuildError::MissingRunImage {
                    component: component_name.clone(),
                })?;

        let mut labels = BTreeMap::from_iter(vec![
            (LOAD_TEST_LABEL.to_owned(), test_name.clone()),
            (ROLE_LABEL.to_owned(), role.as_str().to_owned()),
            (COMPONENT_LABEL.to_owned(), component_name.clone()),
            (GENERATED_LABEL.to_owned(), "true".to_owned()),
        ]);
        if let Some(pool) = &component.pool {
            labels.insert(POOL_LABEL.to_owned(), pool.clone());
        }

        let workspace_mount = VolumeMount {
            name: WORKSPACE_VOLUME_NAME.to_owned(),
            mount_path: WORKSPACE_MOUNT_PATH.to_owned(),
            ..Default::default()
        };

        let mut init_containers = Vec::new();
        if let Some(clone) = &component.clone {
            let mut env = Vec::new();
            if let Some(repo) = &clone.repo {
                env.push(EnvVar {
                    name: CLONE_REPO_ENV.to_owned(),
                    value: Some(repo.clone()),
                    ..Default::default()
                });
            }
            if let Some(git_ref) = &clone.git_ref {
                env.push(EnvVar {
                    name: CLONE_GIT_REF_ENV.to_owned(),
                    value: Some(git_ref.clone()),
                    ..Default::default()
                });
            }
            init_containers.push(Container {
                name: CLONE_INIT_CONTAINER_NAME.to_owned(),
                image: clone.image.clone(),
                env: Some(env),
                volume_mounts: Some(vec![workspace_mount.clone()]),
                ..Default::default()
            });
        }
        if let Some(build) = &component.build {
            init_containers.push(Container {
                name: BUILD_INIT_CONTAINER_NAME.to_owned(),
                image: build.image.clone(),
                command: Some(build.command.clone()),
                args: Some(build.args.clone()),
                env: Some(build.env.clone()),
                working_dir: Some(WORKSPACE_MOUNT_PATH.to_owned()),
                volume_mounts: Some(vec![workspace_mount.clone()]),
                ..Default::default()
            });
        }

        let mut run_env = component.run.env.clone();
        let mut run_mounts = vec![workspace_mount];
        run_mounts.extend(component.run.volume_mounts.iter().cloned());
        let mut volumes = vec![Volume {
            name: WORKSPACE_VOLUME_NAME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }];

        let ports = match role {
            Role::Driver => {
                if !self.test.spec.scenarios_json.is_empty() {
                    run_env.push(EnvVar {
                        name: SCENARIOS_FILE_ENV.to_owned(),
                        value: Some(format!("{SCENARIOS_MOUNT_PATH}/{SCENARIOS_KEY}")),
                        ..Default::default()
                    });
                    run_mounts.push(VolumeMount {
                        name: SCENARIOS_VOLUME_NAME.to_owned(),
                        mount_path: SCENARIOS_MOUNT_PATH.to_owned(),
                        read_only: Some(true),
                        ..Default::default()
                    });
                    volumes.push(Volume {
                        name: SCENARIOS_VOLUME_NAME.to_owned(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(test_name.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    });
                }
                Some(vec![ContainerPort {
                    name: Some(DRIVER_PORT_NAME.to_owned()),
                    container_port: self.defaults.driver_port,
                    protocol: Some("TCP".to_owned()),
                    ..Default::default()
                }])
            }
            Role::Server => Some(vec![ContainerPort {
                name: Some(SERVER_PORT_NAME.to_owned()),
                container_port: self.defaults.server_port,
                protocol: Some("TCP".to_owned()),
                ..Default::default()
            }]),
            Role::Client => None,
        };

        let run_container = Container {
            name: RUN_CONTAINER_NAME.to_owned(),
            image: Some(run_image),
            command: Some(component.run.command.clone()),
            args: Some(component.run.args.clone()),
            env: Some(run_env),
            ports,
            working_dir: Some(WORKSPACE_MOUNT_PATH.to_owned()),
            volume_mounts: Some(run_mounts),
            ..Default::default()
        };

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(format!("{test_name}-{role}-{component_name}")),
                namespace: self.test.namespace(),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_selector: component.pool.as_ref().map(|pool| {
                    BTreeMap::from_iter(vec![(POOL_LABEL.to_owned(), pool.clone())])
                }),
                restart_policy: Some("Never".to_owned()),
                init_containers: (!init_containers.is_empty()).then_some(init_containers),
                containers: vec![run_container],
                volumes: Some(volumes),
                affinity: Some(generated_pod_anti_affinity()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

/// Hard anti-affinity against any other generated pod on the same node.
/// Using required rather than preferred scheduling is what upholds the
/// one-benchmark-pod-per-node capacity accounting.
fn generated_pod_anti_affinity() -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: GENERATED_LABEL.to_owned(),
                        operator: "Exists".to_owned(),
                        values: None,
                    }]),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
