use super::{first_node, NetworkShape};
use crate::{
    assertions::AssertionReporter,
    network::RegtestNetwork,
    rpc::{RpcClient, RpcError},
    scenario::{During as _, Scenario, ScenarioError},
};

pub const UNKNOWN_ADDRESS: &str = "not-a-real-address";

fn explains_refusal(error: &RpcError) -> bool {
    let RpcError::Application { message, .. } = error else {
        return false;
    };
    let message = message.to_lowercase();
    ["invalid", "not found", "does not hold"]
        .iter()
        .any(|reason| message.contains(reason))
}

/// Ask a node for the key of an address it has never seen. The node must
/// refuse, and the refusal fails the run.
#[derive(Debug, Default)]
pub struct ExportUnknownAddress {
    shape: NetworkShape,
}

impl ExportUnknownAddress {
    pub fn new(shape: NetworkShape) -> Self {
        Self { shape }
    }
}

impl Scenario for ExportUnknownAddress {
    fn name(&self) -> &'static str {
        "export-unknown-address"
    }

    async fn setup_network(
        &mut self,
        network: &mut RegtestNetwork,
    ) -> Result<Vec<RpcClient>, ScenarioError> {
        self.shape.start(network).await
    }

    async fn run_test(
        &mut self,
        nodes: &[RpcClient],
        reporter: &mut AssertionReporter,
    ) -> Result<(), ScenarioError> {
        let node = first_node(nodes)?;
        match node.z_exportkey(UNKNOWN_ADDRESS).await {
            Ok(_) => reporter.assert_true(false, "node refuses to export an unknown address"),
            Err(e) => {
                reporter.assert_true(
                    explains_refusal(&e),
                    "node refuses to export an unknown address with a reason",
                )?;
                Err(e).during("export key for an unknown address")
            }
        }
    }
}
