//! Runs the zero-argument test functions of a program, one at a time, each
//! isolated from the failures of the others.

use crate::interpreter::Interpreter;
use crate::processes::panic_message;
use kestrel_core::{TestDef, TestId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Success,
    Failed(String),
    /// Not among the requested tests.
    NotRun,
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Success => write!(f, "ok"),
            TestOutcome::Failed(msg) => write!(f, "FAILED: {}", msg),
            TestOutcome::NotRun => write!(f, "not run"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub id: TestId,
    pub outcome: TestOutcome,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.outcome == TestOutcome::Success
    }
}

/// Run the tests of `tests` whose id is in `wanted`, in declaration order.
/// A runtime error or a panic fails only the test that raised it; the
/// interpreter's stack is restored before the next one starts.
pub fn run_tests(interp: &mut Interpreter, tests: &[TestDef], wanted: &[TestId]) -> Vec<TestResult> {
    let results: Vec<TestResult> = tests
        .iter()
        .map(|test| {
            let outcome = if wanted.contains(&test.id) {
                run_one(interp, test)
            } else {
                TestOutcome::NotRun
            };
            debug!(module = %test.id.module, test = %test.id.name, %outcome, "test finished");
            TestResult {
                id: test.id.clone(),
                outcome,
            }
        })
        .collect();
    let passed = results.iter().filter(|r| r.passed()).count();
    let failed = results
        .iter()
        .filter(|r| matches!(r.outcome, TestOutcome::Failed(_)))
        .count();
    info!(passed, failed, total = results.len(), "test run complete");
    results
}

fn run_one(interp: &mut Interpreter, test: &TestDef) -> TestOutcome {
    let cp = interp.checkpoint();
    let result = catch_unwind(AssertUnwindSafe(|| interp.call_function(test.function, &[])));
    match result {
        Ok(Ok(_)) => TestOutcome::Success,
        Ok(Err(e)) => TestOutcome::Failed(e.to_string()),
        Err(panic) => {
            interp.restore(cp);
            TestOutcome::Failed(format!("panicked: {}", panic_message(panic.as_ref())))
        }
    }
}
