//! Runner submits batches of LoadTests to a cluster and reports the results.
#![deny(missing_docs)]

mod config;
mod events;
mod junit;
mod runner;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gantry_common::telemetry;
use k8s_openapi::chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::{
    count_configs, create_queue_map, decode_from_files, queue_selector_from_annotation,
    validate_concurrency_levels, ConcurrencyLevels,
};
use crate::events::{EventSink, SinkList, TextSink};
use crate::junit::{JUnitSink, Report};
use crate::runner::{KubeLoadTestService, QueueOutcome, Runner};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input files containing load test configurations.
    #[arg(short = 'i', value_name = "FILE", required = true)]
    inputs: Vec<PathBuf>,

    /// Name of the output file for the JUnit XML report. No report is
    /// written when omitted.
    #[arg(short = 'o', value_name = "PATH")]
    output: Option<PathBuf>,

    /// Name for the testsuites element in the JUnit XML report.
    #[arg(long)]
    junit_suites_name: Option<String>,

    /// Concurrency level, in the form [<queue name>:]<level>.
    #[arg(short = 'c', value_name = "[QUEUE:]LEVEL")]
    concurrency: Vec<String>,

    /// Annotation key to parse for queue assignment.
    #[arg(long, default_value = "pool")]
    annotation_key: String,

    /// Polling interval for load test status.
    #[arg(long, default_value = "20s", value_parser = humantime::parse_duration)]
    polling_interval: Duration,

    /// Maximum retries in case of communication failure.
    #[arg(long, default_value_t = 2)]
    polling_retries: u32,

    /// Namespace tests are created in when their configuration names none.
    #[arg(long, default_value = "default")]
    namespace: String,

    #[arg(long, env = "RUNNER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    telemetry::init_tracing(args.otlp_endpoint.clone()).await?;

    let configs = decode_from_files(&args.inputs)?;
    let queue_map = create_queue_map(
        configs,
        queue_selector_from_annotation(&args.annotation_key),
    );
    let levels = ConcurrencyLevels::parse(&args.concurrency)?;
    validate_concurrency_levels(&queue_map, &levels)?;

    info!(annotation_key = args.annotation_key, "queue assignment");
    info!(polling_interval = ?args.polling_interval, polling_retries = args.polling_retries, "polling");
    info!(test_counts = ?count_configs(&queue_map), concurrency = %levels, "dispatch plan");

    let report = args.output.as_ref().map(|_| {
        let name = args
            .junit_suites_name
            .clone()
            .unwrap_or_else(|| format!("benchmarks-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()));
        Arc::new(Report::new(&name))
    });

    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TextSink)];
    if let Some(report) = &report {
        sinks.push(Arc::new(JUnitSink::new(report.clone())));
    }
    let sink: Arc<dyn EventSink> = Arc::new(SinkList(sinks));

    let client = kube::Client::try_default().await?;
    let service = Arc::new(KubeLoadTestService::new(client, args.namespace.clone()));
    let runner = Arc::new(Runner::new(
        service,
        args.polling_interval,
        args.polling_retries,
    ));

    let queue_count = queue_map.len();
    let (done_tx, mut done_rx) = mpsc::channel::<QueueOutcome>(queue_count.max(1));
    for (queue_name, configs) in queue_map {
        let runner = runner.clone();
        let sink = sink.clone();
        let done = done_tx.clone();
        let level = levels
            .level(&queue_name)
            .expect("levels were validated for every queue");
        tokio::spawn(async move {
            runner
                .run_queue(&queue_name, configs, sink, level, done)
                .await;
        });
    }
    drop(done_tx);

    let mut failures = 0usize;
    for _ in 0..queue_count {
        let outcome = done_rx
            .recv()
            .await
            .expect("every queue reports an outcome");
        info!(
            queue = outcome.queue_name,
            failures = outcome.failures,
            "done running tests for queue"
        );
        failures += outcome.failures;
    }

    if let (Some(path), Some(report)) = (&args.output, &report) {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create output file {}", path.display()))?;
        report.write_to(file, 2)?;
        info!(path = %path.display(), "wrote JUnit report");
    }

    telemetry::shutdown();
    if failures > 0 {
        error!(failures, "some tests did not succeed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
