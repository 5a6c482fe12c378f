//! Multi-queue dispatcher that submits LoadTests and polls them to a
//! terminal state.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use gantry_common::load_test::{LoadTest, LoadTestState};
use k8s_openapi::chrono::Utc;
use kube::{api::PostParams, Api, Client, ResourceExt};
use tokio::sync::mpsc;

use crate::events::{EventSink, TestInvocation};

/// The slice of the cluster the runner needs: create a test, read it back.
#[async_trait]
pub trait LoadTestService: Send + Sync {
    /// Submit a test to the cluster.
    async fn create(&self, config: &LoadTest) -> Result<LoadTest>;
    /// Fetch a test by name.
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<LoadTest>;
}

/// LoadTestService backed by the apiserver.
pub struct KubeLoadTestService {
    client: Client,
    default_namespace: String,
}

impl KubeLoadTestService {
    /// Create a service; tests whose configuration names no namespace are
    /// created in the default one.
    pub fn new(client: Client, default_namespace: String) -> Self {
        Self {
            client,
            default_namespace,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<LoadTest> {
        Api::namespaced(
            self.client.clone(),
            namespace.unwrap_or(&self.default_namespace),
        )
    }
}

#[async_trait]
impl LoadTestService for KubeLoadTestService {
    async fn create(&self, config: &LoadTest) -> Result<LoadTest> {
        let namespace = config.namespace();
        Ok(self
            .api(namespace.as_deref())
            .create(&PostParams::default(), config)
            .await?)
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<LoadTest> {
        Ok(self.api(namespace).get(name).await?)
    }
}

// A finished or abandoned invocation, reported back to the queue loop.
struct TestOutcome {
    invocation: TestInvocation,
    succeeded: bool,
}

/// What a drained queue reports back to the caller.
#[derive(Debug)]
pub struct QueueOutcome {
    /// Name of the queue.
    pub queue_name: String,
    /// Number of tests that did not reach Succeeded.
    pub failures: usize,
}

/// Dispatches queues of LoadTests with bounded concurrency.
pub struct Runner<S> {
    service: Arc<S>,
    poll_interval: Duration,
    retries: u32,
}

impl<S> Runner<S>
where
    S: LoadTestService + 'static,
{
    /// Create a runner polling at the given interval with the given
    /// per-RPC retry budget.
    pub fn new(service: Arc<S>, poll_interval: Duration, retries: u32) -> Self {
        Self {
            service,
            poll_interval,
            retries,
        }
    }

    /// Run one queue of tests at the given concurrency level. A new test
    /// launches only after an earlier one completes; completions are
    /// consumed in the order the tests finish.
    pub async fn run_queue(
        &self,
        queue_name: &str,
        configs: Vec<LoadTest>,
        sink: Arc<dyn EventSink>,
        concurrency: usize,
        done: mpsc::Sender<QueueOutcome>,
    ) {
        sink.queue_started(queue_name);

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<TestOutcome>();
        let mut in_flight = 0usize;
        let mut failures = 0usize;

        for (index, config) in configs.into_iter().enumerate() {
            while in_flight >= concurrency {
                let outcome = outcome_rx
                    .recv()
                    .await
                    .expect("in-flight tests hold the sender");
                failures += finish_test(sink.as_ref(), outcome);
                in_flight -= 1;
            }

            let mut invocation = TestInvocation::new(queue_name, index, config);
            invocation.start_time = Some(Utc::now());
            sink.test_started(&invocation);
            in_flight += 1;

            let service = self.service.clone();
            let task_sink = sink.clone();
            let tx = outcome_tx.clone();
            let poll_interval = self.poll_interval;
            let retries = self.retries;
            tokio::spawn(async move {
                let succeeded = run_test(
                    service,
                    &mut invocation,
                    task_sink.as_ref(),
                    poll_interval,
                    retries,
                )
                .await;
                let _ = tx.send(TestOutcome {
                    invocation,
                    succeeded,
                });
            });
        }

        // Drain the remaining in-flight tests. Dropping our sender closes
        // the channel once the last task reports.
        drop(outcome_tx);
        while let Some(outcome) = outcome_rx.recv().await {
            failures += finish_test(sink.as_ref(), outcome);
        }

        sink.queue_stopped(queue_name);
        let _ = done
            .send(QueueOutcome {
                queue_name: queue_name.to_owned(),
                failures,
            })
            .await;
    }
}

fn finish_test(sink: &dyn EventSink, mut outcome: TestOutcome) -> usize {
    outcome.invocation.stop_time = Some(Utc::now());
    sink.test_stopped(&outcome.invocation);
    usize::from(!outcome.succeeded)
}

// Create a single LoadTest and monitor it to completion. RPC failures are
// retried up to the budget with one poll interval between attempts;
// exhaustion abandons the test, though it may still run on the cluster.
async fn run_test<S>(
    service: Arc<S>,
    invocation: &mut TestInvocation,
    sink: &dyn EventSink,
    poll_interval: Duration,
    budget: u32,
) -> bool
where
    S: LoadTestService,
{
    let namespace = invocation.config.namespace();
    let name = invocation.config.name_any();

    let mut retries = 0u32;
    loop {
        match service.create(&invocation.config).await {
            Ok(created) => {
                invocation.config.status = created.status;
                sink.info(invocation, &format!("Created test {}", invocation.name));
                break;
            }
            Err(err) => {
                if retries < budget {
                    retries += 1;
                    sink.info(
                        invocation,
                        &format!(
                            "Failed to create test, scheduling retry {retries}/{budget}: {err}"
                        ),
                    );
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
                sink.error(
                    invocation,
                    "Error creating the test",
                    &format!(
                        "Aborting after {budget} retries to create test {}: {err}",
                        invocation.name
                    ),
                );
                return false;
            }
        }
    }

    let mut retries = 0u32;
    let mut previous_line = String::new();
    loop {
        let test = match service.get(namespace.as_deref(), &name).await {
            Ok(test) => test,
            Err(err) => {
                if retries < budget {
                    retries += 1;
                    sink.info(
                        invocation,
                        &format!(
                            "Failed to poll test, scheduling retry {retries}/{budget}: {err}"
                        ),
                    );
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
                sink.error(
                    invocation,
                    "Error polling the test",
                    &format!(
                        "Aborting after {budget} retries to poll test {}: {err}",
                        invocation.name
                    ),
                );
                return false;
            }
        };
        retries = 0;

        invocation.config.status = test.status.clone();
        let status = test.status.unwrap_or_default();
        let line = status_string(&status);

        if status.state.is_terminated() {
            return if status.state == LoadTestState::Succeeded {
                sink.info(
                    invocation,
                    &format!("Test terminated with a status of {:?}", status.state),
                );
                true
            } else {
                sink.error(
                    invocation,
                    "Test failed",
                    &format!(
                        "Test failed with reason {:?}: {}",
                        status.reason, status.message
                    ),
                );
                false
            };
        }

        if status.state == LoadTestState::Running {
            sink.info(invocation, &line);
            tokio::time::sleep(poll_interval).await;
        } else {
            if line != previous_line {
                sink.info(invocation, &line);
            }
            // Back off while the test is still queuing.
            tokio::time::sleep(poll_interval).await;
            tokio::time::sleep(poll_interval).await;
        }
        previous_line = line;
    }
}

// One line of state, reason and message, empty parts omitted.
fn status_string(status: &gantry_common::load_test::LoadTestStatus) -> String {
    let mut parts = vec![status.state.to_string()];
    let reason = status.reason.trim();
    if !reason.is_empty() {
        parts.push(reason.to_owned());
    }
    let message = status.message.trim();
    if !message.is_empty() {
        parts.push(message.to_owned());
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;
    use gantry_common::load_test::{LoadTestSpec, LoadTestStatus};

    use super::*;

    // Scripted service: per-test statuses are served in order, the last
    // one repeating. Tracks the maximum number of concurrently in-flight
    // tests, where in-flight spans create to terminal poll.
    #[derive(Default)]
    struct ScriptedService {
        statuses: BTreeMap<String, Vec<LoadTestState>>,
        create_failures: u32,
        create_attempts: AtomicUsize,
        poll_counts: Mutex<BTreeMap<String, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedService {
        fn succeeding(names: &[&str]) -> Self {
            Self {
                statuses: names
                    .iter()
                    .map(|name| {
                        (
                            name.to_string(),
                            vec![
                                LoadTestState::Pending,
                                LoadTestState::Running,
                                LoadTestState::Succeeded,
                            ],
                        )
                    })
                    .collect(),
                ..Default::default()
            }
        }

        fn with_state(names: &[&str], state: LoadTestState) -> Self {
            Self {
                statuses: names
                    .iter()
                    .map(|name| (name.to_string(), vec![state]))
                    .collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl LoadTestService for ScriptedService {
        async fn create(&self, config: &LoadTest) -> Result<LoadTest> {
            let attempt = self.create_attempts.fetch_add(1, Ordering::SeqCst);
            if (attempt as u32) < self.create_failures {
                return Err(anyhow!("transport failure"));
            }
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            Ok(config.clone())
        }

        async fn get(&self, _namespace: Option<&str>, name: &str) -> Result<LoadTest> {
            let script = self
                .statuses
                .get(name)
                .ok_or_else(|| anyhow!("unknown test {name}"))?;
            let mut counts = self.poll_counts.lock().unwrap();
            let polls = counts.entry(name.to_owned()).or_insert(0);
            let state = *script.get(*polls).unwrap_or(
                script.last().expect("scripts are never empty"),
            );
            *polls += 1;

            if state.is_terminated() {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            let mut test = LoadTest::new(name, LoadTestSpec::default());
            test.status = Some(LoadTestStatus {
                state,
                ..Default::default()
            });
            Ok(test)
        }
    }

    // Sink that records event names in order.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn recorded(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl EventSink for RecordingSink {
        fn queue_started(&self, queue_name: &str) {
            self.push(format!("queue-started {queue_name}"));
        }
        fn queue_stopped(&self, queue_name: &str) {
            self.push(format!("queue-stopped {queue_name}"));
        }
        fn test_started(&self, invocation: &TestInvocation) {
            self.push(format!("started {}", invocation.name));
        }
        fn test_stopped(&self, invocation: &TestInvocation) {
            self.push(format!("stopped {}", invocation.name));
        }
        fn info(&self, _invocation: &TestInvocation, _details: &str) {}
        fn warning(&self, invocation: &TestInvocation, brief: &str, _details: &str) {
            self.push(format!("warning {} {brief}", invocation.name));
        }
        fn error(&self, invocation: &TestInvocation, brief: &str, _details: &str) {
            self.push(format!("error {} {brief}", invocation.name));
        }
    }

    fn configs(names: &[&str]) -> Vec<LoadTest> {
        names
            .iter()
            .map(|name| LoadTest::new(name, LoadTestSpec::default()))
            .collect()
    }

    async fn run_one_queue(
        service: Arc<ScriptedService>,
        names: &[&str],
        concurrency: usize,
    ) -> (QueueOutcome, Arc<RecordingSink>) {
        let runner = Runner::new(service, Duration::from_millis(1), 2);
        let sink = Arc::new(RecordingSink::default());
        let (done_tx, mut done_rx) = mpsc::channel(1);

        runner
            .run_queue("pool", configs(names), sink.clone(), concurrency, done_tx)
            .await;
        let outcome = done_rx.recv().await.expect("queue should report");
        (outcome, sink)
    }

    #[tokio::test]
    async fn runs_every_test_and_reports_no_failures() {
        let service = Arc::new(ScriptedService::succeeding(&["a", "b", "c"]));
        let (outcome, sink) = run_one_queue(service.clone(), &["a", "b", "c"], 1).await;

        assert_eq!(outcome.queue_name, "pool");
        assert_eq!(outcome.failures, 0);

        let events = sink.recorded();
        assert_eq!(events.first().map(String::as_str), Some("queue-started pool"));
        assert_eq!(events.last().map(String::as_str), Some("queue-stopped pool"));
        assert_eq!(events.iter().filter(|e| e.starts_with("started")).count(), 3);
        assert_eq!(events.iter().filter(|e| e.starts_with("stopped")).count(), 3);
    }

    #[tokio::test]
    async fn concurrency_level_bounds_in_flight_tests() {
        let names = ["a", "b", "c", "d", "e"];
        let service = Arc::new(ScriptedService::succeeding(&names));
        let (outcome, _) = run_one_queue(service.clone(), &names, 2).await;

        assert_eq!(outcome.failures, 0);
        assert!(service.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn serial_queue_stops_tests_in_launch_order() {
        let names = ["a", "b", "c"];
        let service = Arc::new(ScriptedService::succeeding(&names));
        let (_, sink) = run_one_queue(service.clone(), &names, 1).await;

        let stops: Vec<String> = sink
            .recorded()
            .into_iter()
            .filter(|event| event.starts_with("stopped"))
            .collect();
        assert_eq!(stops, ["stopped a", "stopped b", "stopped c"]);
    }

    #[tokio::test]
    async fn failed_tests_are_counted_and_reported() {
        let service = Arc::new(ScriptedService::with_state(
            &["bad"],
            LoadTestState::Errored,
        ));
        let (outcome, sink) = run_one_queue(service, &["bad"], 1).await;

        assert_eq!(outcome.failures, 1);
        assert!(sink
            .recorded()
            .iter()
            .any(|event| event == "error bad Test failed"));
    }

    #[tokio::test]
    async fn create_retries_are_bounded() {
        let mut service = ScriptedService::succeeding(&["a"]);
        // More failures than the retry budget of 2 allows.
        service.create_failures = 3;
        let (outcome, sink) = run_one_queue(Arc::new(service), &["a"], 1).await;

        assert_eq!(outcome.failures, 1);
        assert!(sink
            .recorded()
            .iter()
            .any(|event| event == "error a Error creating the test"));
    }

    #[tokio::test]
    async fn create_failures_within_the_budget_recover() {
        let mut service = ScriptedService::succeeding(&["a"]);
        service.create_failures = 2;
        let (outcome, _) = run_one_queue(Arc::new(service), &["a"], 1).await;
        assert_eq!(outcome.failures, 0);
    }
}
