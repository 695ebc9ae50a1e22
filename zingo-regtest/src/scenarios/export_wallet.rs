use std::path::{Path, PathBuf};

use super::{first_node, NetworkShape};
use crate::{
    assertions::AssertionReporter,
    network::RegtestNetwork,
    rpc::{RpcClient, ShieldedPool},
    scenario::{During as _, Scenario, ScenarioError},
};

pub const DUMP_FILE_NAME: &str = "walletdump";

fn canonical(path: &Path) -> Result<PathBuf, ScenarioError> {
    std::fs::canonicalize(path).map_err(|source| ScenarioError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Dump the wallet of node 0 and check the dump lands in its export
/// directory and covers a freshly generated address.
#[derive(Debug, Default)]
pub struct ExportWallet {
    shape: NetworkShape,
    export_dir: Option<PathBuf>,
}

impl ExportWallet {
    pub fn new(shape: NetworkShape) -> Self {
        Self {
            shape,
            export_dir: None,
        }
    }
}

impl Scenario for ExportWallet {
    fn name(&self) -> &'static str {
        "export-wallet"
    }

    async fn setup_network(
        &mut self,
        network: &mut RegtestNetwork,
    ) -> Result<Vec<RpcClient>, ScenarioError> {
        let nodes = self.shape.start(network).await?;
        self.export_dir = network.nodes().first().and_then(|n| n.config().export_dir());
        Ok(nodes)
    }

    async fn run_test(
        &mut self,
        nodes: &[RpcClient],
        reporter: &mut AssertionReporter,
    ) -> Result<(), ScenarioError> {
        let node = first_node(nodes)?;
        let Some(export_dir) = self.export_dir.as_deref() else {
            return reporter.assert_true(false, "node 0 has an export directory");
        };
        let export_dir = canonical(export_dir)?;

        let address = node
            .z_getnewaddress(ShieldedPool::Sapling)
            .await
            .during("generate sapling address")?;
        let dump = node
            .z_exportwallet(DUMP_FILE_NAME)
            .await
            .during("export wallet")?;
        let dump = canonical(&dump)?;
        reporter.assert_equal(
            Some(export_dir.as_path()),
            dump.parent(),
            "wallet dump is written into the export directory",
        )?;
        let contents = tokio::fs::read_to_string(&dump)
            .await
            .map_err(|source| ScenarioError::Io {
                path: dump.clone(),
                source,
            })?;
        reporter.assert_true(
            contents.contains(&address),
            "wallet dump mentions the new address",
        )
    }
}
