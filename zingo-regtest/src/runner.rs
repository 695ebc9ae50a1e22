//! Drives one scenario from an empty run directory to an exit code.
use std::fmt::Write as _;

use log::{error, info};
use regtestconfig::HarnessConfig;

use crate::{
    assertions::{verdict_of, AssertionRecord, AssertionReporter, Verdict},
    interrupts::{interrupted, with_optional_timeout},
    network::{RegtestNetwork, TeardownReport},
    scenario::{Scenario, ScenarioError},
};

pub const EXIT_PASSED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

/// Everything a finished run produced.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub scenario: &'static str,
    pub result: Result<(), ScenarioError>,
    pub records: Vec<AssertionRecord>,
    pub teardown: Result<(), TeardownReport>,
}

impl ScenarioOutcome {
    pub fn verdict(&self) -> Verdict {
        verdict_of(&self.records)
    }

    pub fn passed(&self) -> bool {
        self.result.is_ok() && self.teardown.is_ok() && self.verdict().is_pass()
    }

    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Err(ScenarioError::Interrupted) => EXIT_INTERRUPTED,
            _ if self.passed() => EXIT_PASSED,
            _ => EXIT_FAILED,
        }
    }

    /// Human readable report: one line per assertion, then the error if any,
    /// then the verdict.
    pub fn summary(&self) -> String {
        let mut summary = String::new();
        for record in &self.records {
            let _ = writeln!(summary, "{record}");
        }
        if let Err(e) = &self.result {
            let _ = writeln!(summary, "{}: {e}", self.scenario);
        }
        if let Err(report) = &self.teardown {
            let _ = writeln!(summary, "teardown: {report}");
        }
        let outcome = if self.passed() { "passed" } else { "failed" };
        let _ = write!(summary, "{} {outcome} ({})", self.scenario, self.verdict());
        summary
    }
}

async fn drive<S: Scenario>(
    scenario: &mut S,
    network: &mut RegtestNetwork,
    reporter: &mut AssertionReporter,
) -> Result<(), ScenarioError> {
    let nodes = scenario.setup_network(network).await?;
    info!("{} network up with {} node(s)", scenario.name(), nodes.len());
    scenario.run_test(&nodes, reporter).await
}

/// Run `scenario` against a network built from `harness`. The network is
/// torn down on every path out, including interrupts and timeouts.
pub async fn run_scenario<S: Scenario>(scenario: &mut S, harness: HarnessConfig) -> ScenarioOutcome {
    let name = scenario.name();
    let limit = harness.scenario_timeout;
    let mut network = RegtestNetwork::new(harness);
    let mut reporter = AssertionReporter::new();

    let result = {
        let body = with_optional_timeout(limit, drive(scenario, &mut network, &mut reporter));
        tokio::select! {
            finished = body => match (finished, limit) {
                (Some(result), _) => result,
                (None, Some(limit)) => Err(ScenarioError::TimedOut(limit)),
                (None, None) => Err(ScenarioError::Interrupted),
            },
            _ = interrupted() => Err(ScenarioError::Interrupted),
        }
    };
    if let Err(e) = &result {
        error!("{name}: {e}");
    }
    let teardown = network.teardown().await;
    ScenarioOutcome {
        scenario: name,
        result,
        records: reporter.into_records(),
        teardown,
    }
}

/// Logging, the run and the run directory's fate, for a binary's `main`.
/// Returns the process exit code.
pub async fn run_main<S: Scenario>(mut scenario: S, harness: HarnessConfig) -> i32 {
    if let Err(e) = std::fs::create_dir_all(&harness.tmpdir) {
        eprintln!("could not create {}: {e}", harness.tmpdir.display());
        return EXIT_FAILED;
    }
    match harness.get_log_config() {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                eprintln!("logging unavailable: {e}");
            }
        }
        Err(e) => eprintln!("logging unavailable: {e}"),
    }
    let tmpdir = harness.tmpdir.clone();
    let nocleanup = harness.nocleanup;
    info!("running {} in {}", scenario.name(), tmpdir.display());

    let outcome = run_scenario(&mut scenario, harness).await;
    println!("{}", outcome.summary());

    if outcome.passed() && !nocleanup {
        info!("cleaning up {}", tmpdir.display());
        if let Err(e) = std::fs::remove_dir_all(&tmpdir) {
            eprintln!("could not remove {}: {e}", tmpdir.display());
        }
    } else {
        println!("not cleaning up dir {}", tmpdir.display());
    }
    outcome.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcClient;

    struct Failing;

    impl Scenario for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn setup_network(
            &mut self,
            _network: &mut RegtestNetwork,
        ) -> Result<Vec<RpcClient>, ScenarioError> {
            Ok(vec![])
        }

        async fn run_test(
            &mut self,
            _nodes: &[RpcClient],
            reporter: &mut AssertionReporter,
        ) -> Result<(), ScenarioError> {
            reporter.assert_true(true, "first check")?;
            reporter.assert_equal("a", "b", "second check")
        }
    }

    struct Stalling;

    impl Scenario for Stalling {
        fn name(&self) -> &'static str {
            "stalling"
        }

        async fn setup_network(
            &mut self,
            _network: &mut RegtestNetwork,
        ) -> Result<Vec<RpcClient>, ScenarioError> {
            std::future::pending().await
        }

        async fn run_test(
            &mut self,
            _nodes: &[RpcClient],
            _reporter: &mut AssertionReporter,
        ) -> Result<(), ScenarioError> {
            Ok(())
        }
    }

    fn harness(dir: &std::path::Path) -> HarnessConfig {
        HarnessConfig::new(dir.join("zcashd"), dir.to_path_buf())
    }

    #[tokio::test]
    async fn assertion_failure_exits_one_and_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_scenario(&mut Failing, harness(dir.path())).await;
        assert_eq!(outcome.exit_code(), EXIT_FAILED);
        assert_eq!(outcome.records.len(), 2);
        assert!(matches!(outcome.result, Err(ScenarioError::Assertion(_))));
        assert!(outcome
            .summary()
            .contains("FAIL second check: expected \"a\", got \"b\""));
    }

    #[tokio::test]
    async fn stalled_scenarios_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = harness(dir.path());
        harness.scenario_timeout = Some(std::time::Duration::from_millis(50));
        let outcome = run_scenario(&mut Stalling, harness).await;
        assert!(matches!(outcome.result, Err(ScenarioError::TimedOut(_))));
        assert_eq!(outcome.exit_code(), EXIT_FAILED);
    }

    #[test]
    fn interruption_maps_to_130() {
        let outcome = ScenarioOutcome {
            scenario: "any",
            result: Err(ScenarioError::Interrupted),
            records: vec![],
            teardown: Ok(()),
        };
        assert_eq!(outcome.exit_code(), EXIT_INTERRUPTED);
    }

    #[test]
    fn unclean_teardown_fails_a_passing_run() {
        let outcome = ScenarioOutcome {
            scenario: "any",
            result: Ok(()),
            records: vec![],
            teardown: Err(TeardownReport { failures: vec![] }),
        };
        assert_eq!(outcome.exit_code(), EXIT_FAILED);
    }
}
