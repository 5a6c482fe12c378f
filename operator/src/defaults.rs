//! Process-wide defaults applied to LoadTests before scheduling.
//!
//! The defaults bundle is loaded from a YAML file at startup and fills in
//! any field a user left unset on a LoadTest: namespace, per-role pools,
//! and clone/build/run images looked up by component language.
use std::collections::BTreeMap;

use gantry_common::load_test::{Component, Driver, LoadTest};
use serde::{Deserialize, Serialize};

/// Errors produced while applying defaults. These are user errors: the test
/// asked for a language the deployment does not know about.
#[derive(Debug, thiserror::Error)]
pub enum DefaultsError {
    /// A build step needs an image and none is configured for the language.
    #[error("no build image known for language {language:?}")]
    MissingBuildImage {
        /// The language with no configured build image.
        language: String,
    },
    /// A run container needs an image and none is configured for the language.
    #[error("no run image known for language {language:?}")]
    MissingRunImage {
        /// The language with no configured run image.
        language: String,
    },
}

/// Build and run images for one language.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageDefault {
    /// The language tag components use to select these images.
    pub language: String,
    /// Image for the build init container.
    pub build_image: String,
    /// Image for the run container.
    pub run_image: String,
}

/// Node labels whose presence marks a node's pool as the default for a role.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolLabelMap {
    /// Label marking the default pool for clients.
    pub client: String,
    /// Label marking the default pool for drivers.
    pub driver: String,
    /// Label marking the default pool for servers.
    pub server: String,
}

/// Configuration for the operator and default values for unset LoadTest
/// fields.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    /// Namespace for tests that do not name one.
    pub component_namespace: String,
    /// Pool for drivers that do not name one. When unset the cluster
    /// default pool for drivers is used at admission time.
    pub driver_pool: Option<String>,
    /// Pool for clients and servers that do not name one. When unset the
    /// cluster default pool for the role is used at admission time.
    pub worker_pool: Option<String>,
    /// Port the driver listens on for worker connections.
    pub driver_port: i32,
    /// Port servers expose to clients.
    pub server_port: i32,
    /// Image for clone init containers that do not name one.
    pub clone_image: String,
    /// Image for driver run containers that do not name one.
    pub driver_image: String,
    /// Build and run images by language.
    pub languages: Vec<LanguageDefault>,
    /// Node labels that mark per-role default pools in the cluster.
    pub default_pool_labels: Option<PoolLabelMap>,
}

/// Image lookups by language, built once from the configured defaults.
pub(crate) struct ImageMap {
    images: BTreeMap<String, (String, String)>,
}

impl ImageMap {
    pub(crate) fn new(languages: &[LanguageDefault]) -> Self {
        Self {
            images: languages
                .iter()
                .map(|l| {
                    (
                        l.language.clone(),
                        (l.build_image.clone(), l.run_image.clone()),
                    )
                })
                .collect(),
        }
    }

    pub(crate) fn build_image(&self, language: &str) -> Result<&str, DefaultsError> {
        self.images
            .get(language)
            .map(|(build, _)| build.as_str())
            .ok_or_else(|| DefaultsError::MissingBuildImage {
                language: language.to_owned(),
            })
    }

    pub(crate) fn run_image(&self, language: &str) -> Result<&str, DefaultsError> {
        self.images
            .get(language)
            .map(|(_, run)| run.as_str())
            .ok_or_else(|| DefaultsError::MissingRunImage {
                language: language.to_owned(),
            })
    }
}

impl Defaults {
    /// Fill in any unset field on the test. Idempotent: applying twice is
    /// the same as applying once.
    pub fn set_load_test_defaults(&self, test: &mut LoadTest) -> Result<(), DefaultsError> {
        let images = ImageMap::new(&self.languages);

        if test
            .metadata
            .namespace
            .as_deref()
            .map(str::is_empty)
            .unwrap_or(true)
        {
            test.metadata.namespace = Some(self.component_namespace.clone());
        }

        if test.spec.driver.is_none() {
            test.spec.driver = Some(Driver {
                component: Component::default(),
            });
        }

        if let Some(driver) = test.spec.driver.as_mut() {
            let component = &mut driver.component;
            Self::set_component_defaults(component, "driver", 0, self.driver_pool.as_ref());
            self.set_init_image_defaults(component, &images)?;
            if component.run.image.is_none() {
                component.run.image = Some(self.driver_image.clone());
            }
        }

        for (i, server) in test.spec.servers.iter_mut().enumerate() {
            let component = &mut server.component;
            Self::set_component_defaults(component, "server", i, self.worker_pool.as_ref());
            self.set_init_image_defaults(component, &images)?;
            if component.run.image.is_none() {
                component.run.image = Some(images.run_image(&component.language)?.to_owned());
            }
        }

        for (i, client) in test.spec.clients.iter_mut().enumerate() {
            let component = &mut client.component;
            Self::set_component_defaults(component, "client", i, self.worker_pool.as_ref());
            self.set_init_image_defaults(component, &images)?;
            if component.run.image.is_none() {
                component.run.image = Some(images.run_image(&component.language)?.to_owned());
            }
        }

        Ok(())
    }

    fn set_component_defaults(
        component: &mut Component,
        role: &str,
        index: usize,
        pool: Option<&String>,
    ) {
        if component.name.is_none() {
            component.name = Some(format!("{role}-{index}"));
        }
        if component.pool.is_none() {
            component.pool = pool.cloned();
        }
    }

    fn set_init_image_defaults(
        &self,
        component: &mut Component,
        images: &ImageMap,
    ) -> Result<(), DefaultsError> {
        if let Some(clone) = component.clone.as_mut() {
            if clone.image.is_none() {
                clone.image = Some(self.clone_image.clone());
            }
        }
        if let Some(build) = component.build.as_mut() {
            if build.image.is_none() {
                build.image = Some(images.build_image(&component.language)?.to_owned());
            }
        }
        Ok(())
    }
}
