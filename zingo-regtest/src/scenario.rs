//! What a scenario is, and how it fails.
use std::{path::PathBuf, time::Duration};

use crate::{
    assertions::{AssertionRecord, AssertionReporter},
    network::{RegtestNetwork, SetupError, SyncError},
    rpc::{RpcClient, RpcError},
};

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("assertion failed: {0}")]
    Assertion(AssertionRecord),
    #[error("{step} failed: {source}")]
    Rpc {
        step: &'static str,
        #[source]
        source: RpcError,
    },
    #[error("network setup failed: {0}")]
    Setup(#[from] SetupError),
    #[error("nodes did not sync: {0}")]
    Sync(#[from] SyncError),
    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("interrupted")]
    Interrupted,
    #[error("scenario did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Tag an rpc failure with the scenario step it happened in.
pub trait During<T> {
    fn during(self, step: &'static str) -> Result<T, ScenarioError>;
}

impl<T> During<T> for Result<T, RpcError> {
    fn during(self, step: &'static str) -> Result<T, ScenarioError> {
        self.map_err(|source| ScenarioError::Rpc { step, source })
    }
}

/// A test against a freshly started network.
///
/// `setup_network` starts whatever nodes the scenario needs on the network it
/// is given and returns their clients, which `run_test` then drives. The
/// runner owns the network and tears it down whatever either step returns.
#[allow(async_fn_in_trait)]
pub trait Scenario {
    fn name(&self) -> &'static str;

    async fn setup_network(
        &mut self,
        network: &mut RegtestNetwork,
    ) -> Result<Vec<RpcClient>, ScenarioError>;

    async fn run_test(
        &mut self,
        nodes: &[RpcClient],
        reporter: &mut AssertionReporter,
    ) -> Result<(), ScenarioError>;
}
