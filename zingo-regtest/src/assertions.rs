//! Pass/fail bookkeeping for a scenario run.
use std::fmt::{self, Debug, Display};

use log::{error, info};

use crate::{rpc::RpcError, scenario::ScenarioError};

/// One check made by a scenario. Never holds key material, callers record
/// predicates over secrets rather than the secrets themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssertionRecord {
    pub description: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

impl Display for AssertionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed {
            write!(f, "PASS {}", self.description)
        } else {
            write!(
                f,
                "FAIL {}: expected {}, got {}",
                self.description, self.expected, self.actual
            )
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Verdict {
    pub passed: usize,
    pub failed: usize,
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        self.failed == 0
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.is_pass() { "passed" } else { "failed" };
        write!(
            f,
            "{outcome}: {} assertion(s) passed, {} failed",
            self.passed, self.failed
        )
    }
}

/// Append-only log of the checks made during one run.
#[derive(Debug, Default)]
pub struct AssertionReporter {
    records: Vec<AssertionRecord>,
}

impl AssertionReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(
        &mut self,
        description: &str,
        expected: String,
        actual: String,
        passed: bool,
    ) -> Result<(), ScenarioError> {
        if !passed {
            return Err(self.failure(description, expected, actual));
        }
        let record = AssertionRecord {
            description: description.to_string(),
            expected,
            actual,
            passed,
        };
        info!("{record}");
        self.records.push(record);
        Ok(())
    }

    fn failure(&mut self, description: &str, expected: String, actual: String) -> ScenarioError {
        let record = AssertionRecord {
            description: description.to_string(),
            expected,
            actual,
            passed: false,
        };
        error!("{record}");
        self.records.push(record.clone());
        ScenarioError::Assertion(record)
    }

    pub fn assert_equal<T: Debug + PartialEq>(
        &mut self,
        expected: T,
        actual: T,
        description: &str,
    ) -> Result<(), ScenarioError> {
        let passed = expected == actual;
        self.record(
            description,
            format!("{expected:?}"),
            format!("{actual:?}"),
            passed,
        )
    }

    pub fn assert_true(&mut self, condition: bool, description: &str) -> Result<(), ScenarioError> {
        self.record(
            description,
            "true".to_string(),
            condition.to_string(),
            condition,
        )
    }

    /// Passes when `result` is Ok. The error text becomes the actual value,
    /// so `E` must not render secrets.
    pub fn assert_ok<T, E: Display>(
        &mut self,
        result: Result<T, E>,
        description: &str,
    ) -> Result<T, ScenarioError> {
        match result {
            Ok(value) => {
                self.record(description, "ok".to_string(), "ok".to_string(), true)?;
                Ok(value)
            }
            Err(e) => Err(self.failure(description, "ok".to_string(), e.to_string())),
        }
    }

    /// Passes when `result` is a node-reported error with `code` whose
    /// message contains `fragment`. A success is recorded without its value.
    pub fn assert_rpc_error<T>(
        &mut self,
        result: Result<T, RpcError>,
        code: i64,
        fragment: &str,
        description: &str,
    ) -> Result<(), ScenarioError> {
        let expected = format!("rpc error {code} mentioning {fragment:?}");
        let (actual, passed) = match &result {
            Ok(_) => ("success".to_string(), false),
            Err(RpcError::Application {
                code: found,
                message,
            }) => (
                format!("rpc error {found}: {message}"),
                *found == code && message.to_lowercase().contains(&fragment.to_lowercase()),
            ),
            Err(other) => (other.to_string(), false),
        };
        self.record(description, expected, actual, passed)
    }

    pub fn records(&self) -> &[AssertionRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<AssertionRecord> {
        self.records
    }

    pub fn verdict(&self) -> Verdict {
        verdict_of(&self.records)
    }
}

pub fn verdict_of(records: &[AssertionRecord]) -> Verdict {
    let passed = records.iter().filter(|r| r.passed).count();
    Verdict {
        passed,
        failed: records.len() - passed,
    }
}
