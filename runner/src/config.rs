//! Loads LoadTest configurations and partitions them into queues.
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use gantry_common::load_test::LoadTest;
use serde::Deserialize;

/// Configurations grouped by the queue they are dispatched through.
pub type QueueMap = BTreeMap<String, Vec<LoadTest>>;

/// Decode every YAML document in the given files into LoadTests, in file
/// then document order.
pub fn decode_from_files(paths: &[PathBuf]) -> Result<Vec<LoadTest>> {
    let mut configs = Vec::new();
    for path in paths {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?;
        for document in serde_yaml::Deserializer::from_str(&contents) {
            let config = LoadTest::deserialize(document)
                .with_context(|| format!("failed to decode load test in {}", path.display()))?;
            configs.push(config);
        }
    }
    Ok(configs)
}

/// A queue selector that reads the value of an annotation. Configurations
/// without the annotation land in the unnamed queue.
pub fn queue_selector_from_annotation(key: &str) -> impl Fn(&LoadTest) -> String + '_ {
    move |config| {
        config
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .cloned()
            .unwrap_or_default()
    }
}

/// Partition configurations into named queues with a selector.
pub fn create_queue_map(
    configs: Vec<LoadTest>,
    selector: impl Fn(&LoadTest) -> String,
) -> QueueMap {
    let mut map = QueueMap::new();
    for config in configs {
        map.entry(selector(&config)).or_default().push(config);
    }
    map
}

/// The number of configurations per queue, for startup logging.
pub fn count_configs(map: &QueueMap) -> BTreeMap<String, usize> {
    map.iter()
        .map(|(queue, configs)| (queue.clone(), configs.len()))
        .collect()
}

/// Per-queue concurrency caps parsed from repeated `[queue:]<level>` flags.
/// A bare level names the unnamed queue.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConcurrencyLevels(BTreeMap<String, usize>);

impl ConcurrencyLevels {
    /// Parse repeated flag values.
    pub fn parse(values: &[String]) -> Result<Self> {
        let mut levels = BTreeMap::new();
        for value in values {
            let (queue, level) = match value.rsplit_once(':') {
                Some((queue, level)) => (queue, level),
                None => ("", value.as_str()),
            };
            let level: usize = level
                .parse()
                .with_context(|| format!("invalid concurrency level {value:?}"))?;
            if level == 0 {
                bail!("concurrency level for queue {queue:?} must be positive");
            }
            levels.insert(queue.to_owned(), level);
        }
        Ok(Self(levels))
    }

    /// The cap for a queue, if one was specified.
    pub fn level(&self, queue: &str) -> Option<usize> {
        self.0.get(queue).copied()
    }
}

impl std::fmt::Display for ConcurrencyLevels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (queue, level) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{queue}:{level}")?;
            first = false;
        }
        Ok(())
    }
}

/// Every queue that will dispatch tests must have a concurrency level;
/// validation happens before any test is created.
pub fn validate_concurrency_levels(map: &QueueMap, levels: &ConcurrencyLevels) -> Result<()> {
    for queue in map.keys() {
        if levels.level(queue).is_none() {
            bail!("no concurrency level specified for queue {queue:?}");
        }
    }
    Ok(())
}
