#![forbid(unsafe_code)]
//! Configuration for a local regtest network of zcashd nodes.
//!
//! Everything a run needs to know before the first process is spawned lives
//! here: where the node binary is, the run directory, the port layout, the
//! per-node data and export directories, timeouts, and the log4rs setup.
use std::{
    io::{self, Error, ErrorKind},
    ops::Range,
    path::{Path, PathBuf},
    time::Duration,
};

use log::LevelFilter;
use log4rs::{
    append::{console::ConsoleAppender, console::Target, file::FileAppender},
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

pub mod config_template_fillers;
pub mod network_upgrades;
pub mod ports;

pub use network_upgrades::{nuparams, NetworkUpgrade};
pub use ports::PortSeed;

pub const DEFAULT_LOGFILE_NAME: &str = "test_framework.log";
pub const DEFAULT_CONF_NAME: &str = "zcash.conf";
pub const DEFAULT_RPC_USER: &str = "rt";
pub const DEFAULT_RPC_PASSWORD: &str = "rt";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SCENARIO_TIMEOUT: Duration = Duration::from_secs(600);
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound on nodes in a single run, the port layout reserves this many slots.
pub const MAX_NODES: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("node index {index} is out of range, at most {max} nodes are supported")]
    TooManyNodes { index: usize, max: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainType {
    Testnet,
    Regtest,
    Mainnet,
}

impl ChainType {
    pub fn hrp_sapling_extended_spending_key(&self) -> &str {
        match self {
            ChainType::Testnet => "secret-extended-key-test",
            ChainType::Regtest => "secret-extended-key-regtest",
            ChainType::Mainnet => "secret-extended-key-main",
        }
    }
    pub fn to_zcash_address_network(&self) -> zcash_address::Network {
        match self {
            ChainType::Mainnet => zcash_address::Network::Main,
            ChainType::Testnet => zcash_address::Network::Test,
            ChainType::Regtest => zcash_address::Network::Regtest,
        }
    }
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChainType::Testnet => "test",
            ChainType::Regtest => "regtest",
            ChainType::Mainnet => "main",
        };
        write!(f, "{name}")
    }
}

/// The basic-auth pair written into every node's zcash.conf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcCredentials {
    pub user: String,
    pub password: String,
}

impl Default for RpcCredentials {
    fn default() -> Self {
        Self {
            user: DEFAULT_RPC_USER.to_string(),
            password: DEFAULT_RPC_PASSWORD.to_string(),
        }
    }
}

/// How the nodes of a network are wired to one another.
///
/// Connectivity is only ever expressed through node arguments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Topology {
    /// Every node connects to its predecessor, forming a chain.
    #[default]
    Joined,
    /// Two halves, chained internally, with no link across the halves.
    Split,
    /// No node is told about any other.
    Isolated,
}

impl Topology {
    pub fn connect_args(&self, index: usize, node_count: usize, seed: PortSeed) -> Vec<String> {
        let linked = match self {
            Topology::Joined => index > 0,
            Topology::Split => index > 0 && index != node_count / 2,
            Topology::Isolated => false,
        };
        if linked {
            vec![format!("-connect=127.0.0.1:{}", seed.p2p_port(index - 1))]
        } else {
            vec![]
        }
    }

    /// The index ranges of nodes that can reach one another.
    pub fn groups(&self, node_count: usize) -> Vec<Range<usize>> {
        match self {
            Topology::Joined => vec![0..node_count],
            Topology::Split => vec![0..node_count / 2, node_count / 2..node_count],
            Topology::Isolated => (0..node_count).map(|index| index..index + 1).collect(),
        }
    }
}

/// Everything needed to launch one node. Immutable once a process has been
/// started from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    pub index: usize,
    pub data_dir: PathBuf,
    pub p2p_port: u16,
    pub rpc_port: u16,
    pub credentials: RpcCredentials,
    pub extra_args: Vec<String>,
}

impl NodeConfig {
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_export_dir(self, export_dir: &Path) -> Self {
        self.with_arg(format!("-exportdir={}", export_dir.display()))
    }

    /// The export directory handed to the node, if any. The last occurrence
    /// wins, as it does for the node's own argument parser.
    pub fn export_dir(&self) -> Option<PathBuf> {
        self.extra_args
            .iter()
            .rev()
            .find_map(|arg| arg.strip_prefix("-exportdir="))
            .map(PathBuf::from)
    }

    pub fn conf_path(&self) -> PathBuf {
        self.data_dir.join(DEFAULT_CONF_NAME)
    }

    pub fn rpc_uri(&self) -> http::Uri {
        // host and port are always well formed
        http::Uri::builder()
            .scheme("http")
            .authority(format!("127.0.0.1:{}", self.rpc_port))
            .path_and_query("/")
            .build()
            .unwrap_or_default()
    }

    /// The full argument vector for the node binary.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![format!("-datadir={}", self.data_dir.display())];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Configuration shared by every node of a run.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// The node executable.
    pub zcashd_bin: PathBuf,
    /// Root of the run, node and export directories are created beneath it.
    pub tmpdir: PathBuf,
    pub chain: ChainType,
    pub port_seed: PortSeed,
    pub credentials: RpcCredentials,
    pub ready_timeout: Duration,
    pub rpc_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub poll_interval: Duration,
    pub trace_rpc: bool,
    /// Leave the run directory in place after the run.
    pub nocleanup: bool,
    /// Bound on setup plus the scenario body, teardown always follows.
    pub scenario_timeout: Option<Duration>,
    pub log_to_stderr: bool,
    pub logfile_name: PathBuf,
    /// Lines appended verbatim to every node's zcash.conf.
    pub extra_conf: Vec<String>,
}

impl HarnessConfig {
    pub fn new(zcashd_bin: PathBuf, tmpdir: PathBuf) -> Self {
        Self {
            zcashd_bin,
            tmpdir,
            chain: ChainType::Regtest,
            port_seed: PortSeed::from_process(),
            credentials: RpcCredentials::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            poll_interval: READY_POLL_INTERVAL,
            trace_rpc: false,
            nocleanup: false,
            scenario_timeout: Some(DEFAULT_SCENARIO_TIMEOUT),
            log_to_stderr: false,
            logfile_name: DEFAULT_LOGFILE_NAME.into(),
            extra_conf: vec![],
        }
    }

    pub fn node_data_dir(&self, index: usize) -> PathBuf {
        self.tmpdir.join(format!("node{index}"))
    }

    pub fn node_export_dir(&self, index: usize) -> PathBuf {
        self.tmpdir.join(format!("export{index}"))
    }

    /// A config for node `index` with its ports and data directory assigned
    /// and no extra arguments.
    pub fn node_config(&self, index: usize) -> Result<NodeConfig, ConfigError> {
        if index >= MAX_NODES {
            return Err(ConfigError::TooManyNodes {
                index,
                max: MAX_NODES,
            });
        }
        Ok(NodeConfig {
            index,
            data_dir: self.node_data_dir(index),
            p2p_port: self.port_seed.p2p_port(index),
            rpc_port: self.port_seed.rpc_port(index),
            credentials: self.credentials.clone(),
            extra_args: vec![],
        })
    }

    /// The zcash.conf contents for `node`.
    pub fn render_conf(&self, node: &NodeConfig) -> String {
        let extra = self
            .extra_conf
            .iter()
            .map(|line| format!("{line}\n"))
            .collect::<String>();
        config_template_fillers::zcashd::basic(node, &extra)
    }

    pub fn get_log_path(&self) -> PathBuf {
        self.tmpdir.join(&self.logfile_name)
    }

    /// Build the Logging config
    pub fn get_log_config(&self) -> io::Result<Config> {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d} {l} {t}::{m}{n}")))
            .build(self.get_log_path())?;

        let mut builder = Config::builder().appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(LevelFilter::Debug)))
                .build("logfile", Box::new(logfile)),
        );
        let mut root = Root::builder().appender("logfile");
        if self.log_to_stderr {
            let console = ConsoleAppender::builder()
                .target(Target::Stderr)
                .encoder(Box::new(PatternEncoder::new("{l}::{m}{n}")))
                .build();
            builder = builder.appender(
                Appender::builder()
                    .filter(Box::new(ThresholdFilter::new(LevelFilter::Info)))
                    .build("stderr", Box::new(console)),
            );
            root = root.appender("stderr");
        }
        builder
            .build(root.build(LevelFilter::Debug))
            .map_err(|e| Error::new(ErrorKind::Other, format!("{}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn harness() -> HarnessConfig {
        let mut config = HarnessConfig::new(PathBuf::from("zcashd"), PathBuf::from("/tmp/run"));
        config.port_seed = PortSeed::new(7);
        config
    }

    #[test]
    fn node_directories_are_distinct_per_index() {
        let config = harness();
        let zero = config.node_config(0).unwrap();
        let one = config.node_config(1).unwrap();
        assert_eq!(zero.data_dir, PathBuf::from("/tmp/run/node0"));
        assert_ne!(zero.data_dir, one.data_dir);
        assert_ne!(config.node_export_dir(0), config.node_export_dir(1));
        assert_ne!(zero.rpc_port, one.rpc_port);
        assert_ne!(zero.p2p_port, one.p2p_port);
    }

    #[test]
    fn node_index_is_bounded() {
        assert!(matches!(
            harness().node_config(MAX_NODES),
            Err(ConfigError::TooManyNodes { index: MAX_NODES, .. })
        ));
    }

    #[test]
    fn command_args_start_with_datadir() {
        let config = harness();
        let node = config
            .node_config(0)
            .unwrap()
            .with_export_dir(&config.node_export_dir(0))
            .with_arg("-debug=1");
        assert_eq!(
            node.command_args(),
            vec![
                "-datadir=/tmp/run/node0".to_string(),
                "-exportdir=/tmp/run/export0".to_string(),
                "-debug=1".to_string(),
            ]
        );
        assert_eq!(node.export_dir(), Some(PathBuf::from("/tmp/run/export0")));
    }

    #[test]
    fn rpc_uri_targets_loopback() {
        let node = harness().node_config(2).unwrap();
        let uri = node.rpc_uri();
        assert_eq!(uri.host(), Some("127.0.0.1"));
        assert_eq!(uri.port_u16(), Some(node.rpc_port));
    }

    #[test_case(Topology::Joined, 0 => 0 ; "joined head has no peer")]
    #[test_case(Topology::Joined, 2 => 1 ; "joined tail links back")]
    #[test_case(Topology::Split, 1 => 1 ; "split first half links")]
    #[test_case(Topology::Split, 2 => 0 ; "split boundary is cut")]
    #[test_case(Topology::Split, 3 => 1 ; "split second half links")]
    #[test_case(Topology::Isolated, 3 => 0 ; "isolated never links")]
    fn topology_connect_args(topology: Topology, index: usize) -> usize {
        topology.connect_args(index, 4, PortSeed::new(7)).len()
    }

    #[test_case(Topology::Joined => vec![0..4])]
    #[test_case(Topology::Split => vec![0..2, 2..4])]
    #[test_case(Topology::Isolated => vec![0..1, 1..2, 2..3, 3..4])]
    fn topology_groups(topology: Topology) -> Vec<Range<usize>> {
        topology.groups(4)
    }

    #[test]
    fn split_groups_match_the_cut_connect_args() {
        let seed = PortSeed::new(7);
        for group in Topology::Split.groups(5) {
            assert!(Topology::Split
                .connect_args(group.start, 5, seed)
                .is_empty());
            for index in group.start + 1..group.end {
                assert_eq!(Topology::Split.connect_args(index, 5, seed).len(), 1);
            }
        }
    }

    #[test]
    fn joined_topology_points_at_predecessor() {
        let seed = PortSeed::new(7);
        assert_eq!(
            Topology::Joined.connect_args(1, 2, seed),
            vec![format!("-connect=127.0.0.1:{}", seed.p2p_port(0))]
        );
    }

    #[test]
    fn log_config_writes_into_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::new(PathBuf::from("zcashd"), dir.path().to_path_buf());
        config.log_to_stderr = true;
        assert!(config.get_log_config().is_ok());
        assert_eq!(config.get_log_path(), dir.path().join(DEFAULT_LOGFILE_NAME));
    }
}
