use log::{debug, info};
use regtestconfig::ChainType;
use secrecy::SecretString;

use super::{first_node, NetworkShape};
use crate::{
    assertions::AssertionReporter,
    keys::{validate_sapling_address, validate_spending_key, KeyMaterial},
    network::RegtestNetwork,
    rpc::{RpcClient, ShieldedPool, RPC_INVALID_ADDRESS_OR_KEY},
    scenario::{During as _, Scenario, ScenarioError},
};

/// Bech32 with the right prefix but a payload that is not a key.
const MALFORMED_KEY: &str = "secret-extended-key-regtest1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundTripState {
    Idle,
    NetworkUp,
    AddressGenerated,
    KeyExported,
    KeyReimported,
    Verified,
    Failed,
}

/// Generate a sapling address, export its spending key and import that key
/// back into the same wallet, twice.
#[derive(Debug)]
pub struct WalletImportExport {
    shape: NetworkShape,
    chain: ChainType,
    state: RoundTripState,
}

impl Default for WalletImportExport {
    fn default() -> Self {
        Self::new(NetworkShape::default())
    }
}

impl WalletImportExport {
    pub fn new(shape: NetworkShape) -> Self {
        Self {
            shape,
            chain: ChainType::Regtest,
            state: RoundTripState::Idle,
        }
    }

    pub fn state(&self) -> RoundTripState {
        self.state
    }

    fn advance(&mut self, next: RoundTripState) {
        debug!("{} {:?} -> {:?}", self.name(), self.state, next);
        self.state = next;
    }

    async fn round_trip(
        &mut self,
        nodes: &[RpcClient],
        reporter: &mut AssertionReporter,
    ) -> Result<(), ScenarioError> {
        let node = first_node(nodes)?;
        let chain = self.chain;

        let address = node
            .z_getnewaddress(ShieldedPool::Sapling)
            .await
            .during("generate sapling address")?;
        reporter.assert_ok(
            validate_sapling_address(&address, chain),
            &format!("new address is a {chain} sapling address"),
        )?;
        self.advance(RoundTripState::AddressGenerated);

        let private_key = node
            .z_exportkey(&address)
            .await
            .during("export spending key")?;
        reporter.assert_ok(
            validate_spending_key(&private_key, chain),
            "exported key is a sapling extended spending key",
        )?;
        let keys = KeyMaterial::new(address, private_key);
        self.advance(RoundTripState::KeyExported);

        let imported = reporter.assert_ok(
            node.z_importkey(&keys.private_key).await,
            "importing a key the wallet already holds succeeds",
        )?;
        if let Some(imported) = imported {
            reporter.assert_equal(
                keys.address.as_str(),
                imported.address.as_str(),
                "import reports the exported address",
            )?;
        }
        reporter.assert_ok(
            node.z_importkey(&keys.private_key).await,
            "importing the same key a second time succeeds",
        )?;
        self.advance(RoundTripState::KeyReimported);

        let listed = node
            .z_listaddresses()
            .await
            .during("list addresses")?;
        reporter.assert_equal(
            1,
            listed.iter().filter(|a| **a == keys.address).count(),
            "address is listed exactly once after reimport",
        )?;
        let exported_again = node
            .z_exportkey(&keys.address)
            .await
            .during("export spending key again")?;
        reporter.assert_true(
            keys.same_key_as(&exported_again),
            "a second export yields the same key",
        )?;
        let malformed = SecretString::new(MALFORMED_KEY.to_string());
        reporter.assert_rpc_error(
            node.z_importkey(&malformed).await,
            RPC_INVALID_ADDRESS_OR_KEY,
            "invalid",
            "a malformed spending key is refused",
        )?;

        for other in nodes.iter().skip(1) {
            reporter.assert_ok(
                other.z_importkey(&keys.private_key).await,
                &format!("node {} accepts the key", other.node_index()),
            )?;
            let listed = other
                .z_listaddresses()
                .await
                .during("list addresses on another node")?;
            reporter.assert_true(
                listed.contains(&keys.address),
                &format!("node {} lists the imported address", other.node_index()),
            )?;
        }

        self.advance(RoundTripState::Verified);
        info!("{} verified {} node(s)", self.name(), nodes.len());
        Ok(())
    }
}

impl Scenario for WalletImportExport {
    fn name(&self) -> &'static str {
        "wallet-import-export"
    }

    async fn setup_network(
        &mut self,
        network: &mut RegtestNetwork,
    ) -> Result<Vec<RpcClient>, ScenarioError> {
        self.chain = network.harness().chain;
        match self.shape.start(network).await {
            Ok(nodes) => {
                self.advance(RoundTripState::NetworkUp);
                Ok(nodes)
            }
            Err(e) => {
                self.advance(RoundTripState::Failed);
                Err(e)
            }
        }
    }

    async fn run_test(
        &mut self,
        nodes: &[RpcClient],
        reporter: &mut AssertionReporter,
    ) -> Result<(), ScenarioError> {
        let result = self.round_trip(nodes, reporter).await;
        if result.is_err() {
            self.advance(RoundTripState::Failed);
        }
        result
    }
}
