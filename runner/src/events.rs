//! Test lifecycle events emitted by the dispatcher.
//!
//! Sinks observe queue and test boundaries plus per-test log lines. The
//! text sink forwards everything to tracing; the JUnit sink in the junit
//! module folds the same events into an XML report.
use gantry_common::load_test::LoadTest;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{error, info, warn};

/// One attempt to run one LoadTest, with its own timestamps and log context.
#[derive(Debug, Clone)]
pub struct TestInvocation {
    /// Queue the test was submitted through.
    pub queue_name: String,
    /// Launch ordinal within the queue.
    pub index: usize,
    /// Display name of the test.
    pub name: String,
    /// The configuration submitted to the cluster. Its status field is
    /// refreshed on every poll.
    pub config: LoadTest,
    /// When the invocation was launched.
    pub start_time: Option<DateTime<Utc>>,
    /// When the invocation finished or was abandoned.
    pub stop_time: Option<DateTime<Utc>>,
}

impl TestInvocation {
    /// Create an invocation for a configuration queued for submission.
    pub fn new(queue_name: &str, index: usize, config: LoadTest) -> Self {
        let name = config.name_any();
        Self {
            queue_name: queue_name.to_owned(),
            index,
            name,
            config,
            start_time: None,
            stop_time: None,
        }
    }

    /// Seconds between launch and completion, zero while in flight.
    pub fn duration_seconds(&self) -> f64 {
        match (self.start_time, self.stop_time) {
            (Some(start), Some(stop)) => {
                (stop - start).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        }
    }
}

/// Observer of runner events. Implementations must serialize their own
/// state; events arrive concurrently from every in-flight test.
pub trait EventSink: Send + Sync {
    /// A queue began dispatching.
    fn queue_started(&self, queue_name: &str);
    /// A queue drained its last test.
    fn queue_stopped(&self, queue_name: &str);
    /// A test was launched.
    fn test_started(&self, invocation: &TestInvocation);
    /// A test finished or was abandoned.
    fn test_stopped(&self, invocation: &TestInvocation);
    /// Progress detail for a test.
    fn info(&self, invocation: &TestInvocation, details: &str);
    /// A recoverable problem with a test.
    fn warning(&self, invocation: &TestInvocation, brief: &str, details: &str);
    /// A fatal problem with a test.
    fn error(&self, invocation: &TestInvocation, brief: &str, details: &str);
}

/// Sink that forwards every event to tracing.
pub struct TextSink;

impl EventSink for TextSink {
    fn queue_started(&self, queue_name: &str) {
        info!(queue = queue_name, "queue started");
    }

    fn queue_stopped(&self, queue_name: &str) {
        info!(queue = queue_name, "queue stopped");
    }

    fn test_started(&self, invocation: &TestInvocation) {
        info!(
            queue = invocation.queue_name,
            test = invocation.name,
            "test started"
        );
    }

    fn test_stopped(&self, invocation: &TestInvocation) {
        info!(
            queue = invocation.queue_name,
            test = invocation.name,
            duration_seconds = invocation.duration_seconds(),
            "test stopped"
        );
    }

    fn info(&self, invocation: &TestInvocation, details: &str) {
        info!(queue = invocation.queue_name, test = invocation.name, "{details}");
    }

    fn warning(&self, invocation: &TestInvocation, brief: &str, details: &str) {
        warn!(
            queue = invocation.queue_name,
            test = invocation.name,
            brief, "{details}"
        );
    }

    fn error(&self, invocation: &TestInvocation, brief: &str, details: &str) {
        error!(
            queue = invocation.queue_name,
            test = invocation.name,
            brief, "{details}"
        );
    }
}

/// Fans every event out to a list of sinks.
pub struct SinkList(pub Vec<std::sync::Arc<dyn EventSink>>);

impl EventSink for SinkList {
    fn queue_started(&self, queue_name: &str) {
        for sink in &self.0 {
            sink.queue_started(queue_name);
        }
    }

    fn queue_stopped(&self, queue_name: &str) {
        for sink in &self.0 {
            sink.queue_stopped(queue_name);
        }
    }

    fn test_started(&self, invocation: &TestInvocation) {
        for sink in &self.0 {
            sink.test_started(invocation);
        }
    }

    fn test_stopped(&self, invocation: &TestInvocation) {
        for sink in &self.0 {
            sink.test_stopped(invocation);
        }
    }

    fn info(&self, invocation: &TestInvocation, details: &str) {
        for sink in &self.0 {
            sink.info(invocation, details);
        }
    }

    fn warning(&self, invocation: &TestInvocation, brief: &str, details: &str) {
        for sink in &self.0 {
            sink.warning(invocation, brief, details);
        }
    }

    fn error(&self, invocation: &TestInvocation, brief: &str, details: &str) {
        for sink in &self.0 {
            sink.error(invocation, brief, details);
        }
    }
}
