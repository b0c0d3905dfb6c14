//! Fixture test suites: deploy, call, report.
//!
//! Every case deploys a fresh instance of its fixture and performs its calls
//! in order. A case moves through [`CaseState`] and ends `Passed` or `Failed`;
//! the first error fails it and is kept as the diagnostic.

use std::{fmt, time::Duration};

use alloy::{dyn_abi::DynSolValue, primitives::U256};
use futures::future;

use crate::{
    chain::ChainClient,
    error::{HarnessError, Result},
    harness::Harness,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    Fresh,
    Deployed,
    Invoked,
    Passed,
    Failed,
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Fresh => "fresh",
            Self::Deployed => "deployed",
            Self::Invoked => "invoked",
            Self::Passed => "passed",
            Self::Failed => "failed",
        };
        f.write_str(state)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: String,
    pub args: Vec<DynSolValue>,
}

impl Call {
    pub fn new(method: impl Into<String>, args: Vec<DynSolValue>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    /// Artifact deployed before the calls.
    pub fixture: String,
    pub calls: Vec<Call>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, fixture: impl Into<String>, calls: Vec<Call>) -> Self {
        Self {
            name: name.into(),
            fixture: fixture.into(),
            calls,
        }
    }
}

#[derive(Debug)]
pub struct CaseReport {
    pub name: String,
    /// `Passed` or `Failed`.
    pub state: CaseState,
    /// Last state reached before the case ended.
    pub reached: CaseState,
    pub error: Option<HarnessError>,
    pub elapsed: Duration,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        self.state == CaseState::Passed
    }
}

#[derive(Debug)]
pub struct SuiteReport {
    pub suite: String,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.cases.iter().all(CaseReport::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseReport> {
        self.cases.iter().filter(|case| !case.passed())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suite {
    pub name: String,
    /// Position of the sending account, distinct per concurrently run suite.
    pub sender: usize,
    pub cases: Vec<TestCase>,
    /// Per case bound, the harness test timeout unless set.
    pub timeout: Option<Duration>,
}

impl Suite {
    pub fn new(name: impl Into<String>, cases: Vec<TestCase>) -> Self {
        Self {
            name: name.into(),
            sender: 0,
            cases,
            timeout: None,
        }
    }

    pub fn with_sender(mut self, sender: usize) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn run<C: ChainClient>(&self, harness: &Harness<C>) -> SuiteReport {
        tracing::info!(suite = %self.name, network = %harness.profile().name, "running suite");
        let mut cases = Vec::with_capacity(self.cases.len());
        for case in &self.cases {
            let report = self.run_case(harness, case).await;
            match &report.error {
                None => tracing::info!(suite = %self.name, case = %case.name, "passed"),
                Some(err) => {
                    tracing::error!(suite = %self.name, case = %case.name, %err, "failed")
                }
            }
            cases.push(report);
        }
        SuiteReport {
            suite: self.name.clone(),
            cases,
        }
    }

    async fn run_case<C: ChainClient>(&self, harness: &Harness<C>, case: &TestCase) -> CaseReport {
        let start = tokio::time::Instant::now();
        let timeout = self.timeout.unwrap_or_else(|| harness.test_timeout());
        let mut state = CaseState::Fresh;
        let steps = async {
            let contract = harness.deploy_fixture_from(&case.fixture, self.sender).await?;
            state = CaseState::Deployed;
            for call in &case.calls {
                harness.invoke(&contract, &call.method, &call.args).await?;
                state = CaseState::Invoked;
            }
            Ok::<_, HarnessError>(())
        };
        let outcome = match tokio::time::timeout(timeout, steps).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::TestTimeout {
                case: case.name.clone(),
                timeout,
            }),
        };
        tracing::debug!(case = %case.name, reached = %state, "case finished");
        let (end, error) = match outcome {
            Ok(()) => (CaseState::Passed, None),
            Err(err) => (CaseState::Failed, Some(err)),
        };
        CaseReport {
            name: case.name.clone(),
            state: end,
            reached: state,
            error,
            elapsed: start.elapsed(),
        }
    }
}

/// Runs `suites` one after another, or concurrently when `parallel` is set.
/// Concurrent suites must use distinct senders.
pub async fn run_suites<C: ChainClient>(
    harness: &Harness<C>,
    suites: &[Suite],
    parallel: bool,
) -> Result<Vec<SuiteReport>> {
    if !parallel {
        let mut reports = Vec::with_capacity(suites.len());
        for suite in suites {
            reports.push(suite.run(harness).await);
        }
        return Ok(reports);
    }
    for (i, suite) in suites.iter().enumerate() {
        if let Some(other) = suites[..i].iter().find(|other| other.sender == suite.sender) {
            return Err(HarnessError::InvalidConfig {
                key: "sender".into(),
                value: suite.sender.to_string(),
                reason: format!(
                    "suites `{}` and `{}` share a sender and cannot run concurrently",
                    other.name, suite.name
                ),
            });
        }
        // surface a missing account before anything is deployed
        harness.sender(suite.sender)?;
    }
    Ok(future::join_all(suites.iter().map(|suite| suite.run(harness))).await)
}

/// `FooBar` inherits `foo` from `Foo` and `bar` from `Bar`.
pub fn inheritance_suite() -> Suite {
    Suite::new(
        "InheritenceTestSuite",
        ["foo", "bar"]
            .into_iter()
            .map(|method| TestCase::new(method, "FooBar", vec![Call::new(method, vec![])]))
            .collect(),
    )
}

/// Twelve word-sized arguments must not exhaust the stack.
pub fn stack_depth_suite() -> Suite {
    let args = (1..=12u64)
        .map(|i| DynSolValue::Uint(U256::from(i), 256))
        .collect();
    Suite::new(
        "StackDepthTestSuite",
        vec![TestCase::new(
            "stackNotTooDeep",
            "StackDepthTestSuite",
            vec![Call::new("stackNotTooDeep", args)],
        )],
    )
}

pub fn builtin_suites() -> Vec<Suite> {
    vec![inheritance_suite(), stack_depth_suite()]
}
