//! JUnit-style XML reporting for runner results.
//!
//! Queues map to test suites, invocations to test cases. The report is a
//! thread-safe accumulator fed by an EventSink adapter; every counter
//! update happens under one mutex.
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use k8s_openapi::chrono::{DateTime, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::events::{EventSink, TestInvocation};

/// Whether a recorded failure is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A recoverable problem worth surfacing in the report.
    Warning,
    /// A fatal problem; the test did not succeed.
    Error,
}

impl FailureKind {
    fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Warning => "warning",
            FailureKind::Error => "error",
        }
    }
}

/// A typed failure attached to a test case.
#[derive(Debug, Clone)]
pub struct Failure {
    /// Severity of the failure.
    pub kind: FailureKind,
    /// Short description, the failure element's message attribute.
    pub message: String,
    /// Full detail, the failure element's text.
    pub text: String,
}

#[derive(Debug, Default)]
struct TestCase {
    id: String,
    name: String,
    time_seconds: f64,
    failures: Vec<Failure>,
}

#[derive(Debug, Default)]
struct TestSuite {
    id: String,
    name: String,
    tests: usize,
    failures: usize,
    time_seconds: f64,
    start_time: Option<DateTime<Utc>>,
    case_order: Vec<String>,
    cases: BTreeMap<String, TestCase>,
}

#[derive(Debug, Default)]
struct ReportInner {
    id: String,
    name: String,
    tests: usize,
    failures: usize,
    max_suite_seconds: f64,
    suite_order: Vec<String>,
    suites: BTreeMap<String, TestSuite>,
}

impl ReportInner {
    fn suite(&mut self, queue_name: &str) -> &mut TestSuite {
        if !self.suites.contains_key(queue_name) {
            self.suite_order.push(queue_name.to_owned());
            self.suites.insert(
                queue_name.to_owned(),
                TestSuite {
                    id: dashify(queue_name),
                    name: queue_name.to_owned(),
                    ..Default::default()
                },
            );
        }
        self.suites.get_mut(queue_name).expect("suite was inserted")
    }

    fn case(&mut self, invocation: &TestInvocation) -> &mut TestCase {
        let suite = self.suite(&invocation.queue_name);
        if !suite.cases.contains_key(&invocation.name) {
            suite.case_order.push(invocation.name.clone());
            suite.cases.insert(
                invocation.name.clone(),
                TestCase {
                    id: dashify(&invocation.name),
                    name: invocation.name.clone(),
                    ..Default::default()
                },
            );
        }
        suite
            .cases
            .get_mut(&invocation.name)
            .expect("case was inserted")
    }
}

/// Accumulates suite, case and failure records and serializes them as a
/// JUnit XML document.
pub struct Report {
    inner: Mutex<ReportInner>,
}

impl Report {
    /// Create an empty report; the name becomes the testsuites element.
    pub fn new(name: &str) -> Self {
        Self {
            inner: Mutex::new(ReportInner {
                id: dashify(name),
                name: name.to_owned(),
                ..Default::default()
            }),
        }
    }

    /// A queue began dispatching at the given time.
    pub fn record_suite_start(&self, queue_name: &str, time: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("report mutex should not poison");
        inner.suite(queue_name).start_time = Some(time);
    }

    /// A queue drained; records the suite duration.
    pub fn record_suite_stop(&self, queue_name: &str, time: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("report mutex should not poison");
        let seconds = {
            let suite = inner.suite(queue_name);
            if let Some(start) = suite.start_time {
                suite.time_seconds = (time - start).num_milliseconds().max(0) as f64 / 1000.0;
            }
            suite.time_seconds
        };
        if seconds > inner.max_suite_seconds {
            inner.max_suite_seconds = seconds;
        }
    }

    /// A test launched; bumps the case counters.
    pub fn record_test_start(&self, invocation: &TestInvocation) {
        let mut inner = self.inner.lock().expect("report mutex should not poison");
        inner.case(invocation);
        inner.suite(&invocation.queue_name).tests += 1;
        inner.tests += 1;
    }

    /// A test finished; records the case duration.
    pub fn record_test_stop(&self, invocation: &TestInvocation) {
        let mut inner = self.inner.lock().expect("report mutex should not poison");
        inner.case(invocation).time_seconds = invocation.duration_seconds();
    }

    /// Attach a failure to a case, counting it at the case, suite and
    /// report level.
    pub fn record_failure(&self, invocation: &TestInvocation, failure: Failure) {
        let mut inner = self.inner.lock().expect("report mutex should not poison");
        inner.case(invocation).failures.push(failure);
        inner.suite(&invocation.queue_name).failures += 1;
        inner.failures += 1;
    }

    /// Serialize the report as indented XML.
    pub fn write_to<W: Write>(&self, writer: W, indent: usize) -> Result<()> {
        let inner = self.inner.lock().expect("report mutex should not poison");
        let mut xml = Writer::new_with_indent(writer, b' ', indent);

        let mut suites_start = BytesStart::new("testsuites");
        suites_start.push_attribute(("id", inner.id.as_str()));
        suites_start.push_attribute(("name", inner.name.as_str()));
        suites_start.push_attribute(("tests", inner.tests.to_string().as_str()));
        suites_start.push_attribute(("failures", inner.failures.to_string().as_str()));
        suites_start.push_attribute(("time", format_seconds(inner.max_suite_seconds).as_str()));
        xml.write_event(Event::Start(suites_start))
            .context("failed to write JUnit report to stream")?;

        for queue_name in &inner.suite_order {
            let suite = &inner.suites[queue_name];
            let mut suite_start = BytesStart::new("testsuite");
            suite_start.push_attribute(("id", suite.id.as_str()));
            suite_start.push_attribute(("name", suite.name.as_str()));
            suite_start.push_attribute(("tests", suite.tests.to_string().as_str()));
            suite_start.push_attribute(("failures", suite.failures.to_string().as_str()));
            suite_start.push_attribute(("time", format_seconds(suite.time_seconds).as_str()));
            xml.write_event(Event::Start(suite_start))?;

            for case_name in &suite.case_order {
                let case = &suite.cases[case_name];
                let mut case_start = BytesStart::new("testcase");
                case_start.push_attribute(("id", case.id.as_str()));
                case_start.push_attribute(("name", case.name.as_str()));
                case_start.push_attribute(("time", format_seconds(case.time_seconds).as_str()));
                xml.write_event(Event::Start(case_start))?;

                for failure in &case.failures {
                    let mut failure_start = BytesStart::new("failure");
                    failure_start.push_attribute(("message", failure.message.as_str()));
                    failure_start.push_attribute(("type", failure.kind.as_str()));
                    xml.write_event(Event::Start(failure_start))?;
                    xml.write_event(Event::Text(BytesText::new(&failure.text)))?;
                    xml.write_event(Event::End(BytesEnd::new("failure")))?;
                }

                xml.write_event(Event::End(BytesEnd::new("testcase")))?;
            }

            xml.write_event(Event::End(BytesEnd::new("testsuite")))?;
        }

        xml.write_event(Event::End(BytesEnd::new("testsuites")))
            .context("failed to write JUnit report to stream")?;
        Ok(())
    }
}

/// EventSink that folds runner events into a report.
pub struct JUnitSink {
    report: Arc<Report>,
}

impl JUnitSink {
    /// Create a sink writing into the given report.
    pub fn new(report: Arc<Report>) -> Self {
        Self { report }
    }
}

impl EventSink for JUnitSink {
    fn queue_started(&self, queue_name: &str) {
        self.report.record_suite_start(queue_name, Utc::now());
    }

    fn queue_stopped(&self, queue_name: &str) {
        self.report.record_suite_stop(queue_name, Utc::now());
    }

    fn test_started(&self, invocation: &TestInvocation) {
        self.report.record_test_start(invocation);
    }

    fn test_stopped(&self, invocation: &TestInvocation) {
        self.report.record_test_stop(invocation);
    }

    fn info(&self, _invocation: &TestInvocation, _details: &str) {
        // info messages are not included in JUnit reports
    }

    fn warning(&self, invocation: &TestInvocation, brief: &str, details: &str) {
        self.report.record_failure(
            invocation,
            Failure {
                kind: FailureKind::Warning,
                message: brief.to_owned(),
                text: details.to_owned(),
            },
        );
    }

    fn error(&self, invocation: &TestInvocation, brief: &str, details: &str) {
        self.report.record_failure(
            invocation,
            Failure {
                kind: FailureKind::Error,
                message: brief.to_owned(),
                text: details.to_owned(),
            },
        );
    }
}

/// Derive an XML id from a name: whitespace and underscores become dashes,
/// other non-alphanumeric characters are dropped.
pub fn dashify(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    for character in name.chars() {
        if character == '_' || character.is_whitespace() {
            id.push('-');
        } else if character == '-' || character.is_alphanumeric() {
            id.push(character);
        }
    }
    id
}

fn format_seconds(seconds: f64) -> String {
    format!("{seconds:.3}")
}
