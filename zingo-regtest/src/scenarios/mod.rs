//! The concrete scenarios the harness ships with.
use regtestconfig::{nuparams, NetworkUpgrade, Topology};

use crate::{
    network::{RegtestNetwork, SetupError},
    rpc::RpcClient,
    scenario::ScenarioError,
};

mod export_unknown_address;
mod export_wallet;
mod wallet_import_export;

pub use export_unknown_address::{ExportUnknownAddress, UNKNOWN_ADDRESS};
pub use export_wallet::{ExportWallet, DUMP_FILE_NAME};
pub use wallet_import_export::{RoundTripState, WalletImportExport};

/// How many nodes a scenario starts and how they are wired. Every node gets
/// its own `-exportdir`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkShape {
    pub node_count: usize,
    pub topology: Topology,
    pub extra_args: Vec<String>,
}

impl Default for NetworkShape {
    fn default() -> Self {
        Self {
            node_count: 1,
            topology: Topology::Joined,
            extra_args: vec![],
        }
    }
}

impl NetworkShape {
    pub fn with_nodes(node_count: usize) -> Self {
        Self {
            node_count,
            ..Self::default()
        }
    }

    /// Schedule `upgrade` at `height` on every node.
    pub fn with_upgrade(mut self, upgrade: NetworkUpgrade, height: u32) -> Self {
        self.extra_args.push(nuparams(upgrade, height));
        self
    }

    /// Start the nodes and wait for them to sync before handing them out.
    pub async fn start(&self, network: &mut RegtestNetwork) -> Result<Vec<RpcClient>, ScenarioError> {
        let nodes = network
            .setup_with_topology(self.node_count, self.topology, &self.extra_args)
            .await?;
        network.sync_all(network.harness().ready_timeout).await?;
        Ok(nodes)
    }
}

fn first_node(nodes: &[RpcClient]) -> Result<&RpcClient, ScenarioError> {
    nodes
        .first()
        .ok_or(ScenarioError::Setup(SetupError::NoNodes))
}
