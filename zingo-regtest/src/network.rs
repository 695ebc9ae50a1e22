//! A set of nodes brought up and torn down together.
use std::{collections::HashMap, fmt, future::Future, path::PathBuf, time::Duration};

use futures::future::join_all;
use log::{debug, error, info};
use regtestconfig::{ConfigError, HarnessConfig, NodeConfig, Topology};
use tokio::time::{sleep, Instant};

use crate::{
    process::{LaunchError, ProcessHandle, ReadyError, ShutdownError},
    rpc::{RpcClient, RpcError},
};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("a network needs at least one node")]
    NoNodes,
    #[error("the network is already running {0} node(s)")]
    AlreadyRunning(usize),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("nodes {first} and {second} were both given {path}")]
    SharedDirectory {
        first: usize,
        second: usize,
        path: PathBuf,
    },
    #[error("nodes {first} and {second} were both given port {port}")]
    SharedPort {
        first: usize,
        second: usize,
        port: u16,
    },
    #[error("could not create run directory {path}: {source}")]
    RunDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("node {index} failed to launch: {source}")]
    Launch {
        index: usize,
        #[source]
        source: LaunchError,
    },
    #[error(transparent)]
    NotReady(#[from] ReadyError),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("nodes {nodes:?} still disagree on their {what} after {waited:?}")]
    Diverged {
        what: &'static str,
        nodes: Vec<usize>,
        waited: Duration,
    },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// The secondary failures collected while stopping a network.
#[derive(Debug)]
pub struct TeardownReport {
    pub failures: Vec<ShutdownError>,
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} node(s) did not shut down cleanly",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownReport {}

/// Refuse configs that would have two nodes share a directory or a port.
fn check_exclusive(configs: &[NodeConfig]) -> Result<(), SetupError> {
    let mut dirs: HashMap<PathBuf, usize> = HashMap::new();
    let mut ports: HashMap<u16, usize> = HashMap::new();
    for config in configs {
        let owned_dirs = std::iter::once(config.data_dir.clone()).chain(config.export_dir());
        for path in owned_dirs {
            if let Some(first) = dirs.insert(path.clone(), config.index) {
                return Err(SetupError::SharedDirectory {
                    first,
                    second: config.index,
                    path,
                });
            }
        }
        for port in [config.p2p_port, config.rpc_port] {
            if let Some(first) = ports.insert(port, config.index) {
                return Err(SetupError::SharedPort {
                    first,
                    second: config.index,
                    port,
                });
            }
        }
    }
    Ok(())
}

/// Owns every node of a run. Nodes are started together, handed out only
/// once all of them are ready, and stopped together.
#[derive(Debug)]
pub struct RegtestNetwork {
    harness: HarnessConfig,
    nodes: Vec<ProcessHandle>,
    topology: Topology,
}

/// Poll every client with `query` until all answers are equal or `deadline`
/// passes.
async fn wait_for_agreement<T, F, Fut>(
    clients: &[RpcClient],
    what: &'static str,
    deadline: Instant,
    poll_interval: Duration,
    query: F,
) -> Result<(), SyncError>
where
    T: PartialEq,
    F: Fn(RpcClient) -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let started = Instant::now();
    loop {
        let answers = join_all(clients.iter().cloned().map(&query))
            .await
            .into_iter()
            .collect::<Result<Vec<T>, _>>()?;
        if answers.windows(2).all(|pair| pair[0] == pair[1]) {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(SyncError::Diverged {
                what,
                nodes: clients.iter().map(RpcClient::node_index).collect(),
                waited: now - started,
            });
        }
        debug!("waiting for agreement on {what}");
        sleep(poll_interval.min(deadline - now)).await;
    }
}

impl RegtestNetwork {
    pub fn new(harness: HarnessConfig) -> Self {
        Self {
            harness,
            nodes: vec![],
            topology: Topology::Joined,
        }
    }

    /// How the running nodes are wired. A network started with a bare
    /// [`Self::setup`] counts as joined.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn harness(&self) -> &HarnessConfig {
        &self.harness
    }

    pub fn nodes(&self) -> &[ProcessHandle] {
        &self.nodes
    }

    pub fn running_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_running()).count()
    }

    pub fn clients(&self) -> Vec<RpcClient> {
        self.nodes.iter().map(|node| node.rpc().clone()).collect()
    }

    /// Start `node_count` nodes configured by `config_fn` and wait for all of
    /// them. On any failure every node started so far is stopped before the
    /// error is returned.
    pub async fn setup<F>(
        &mut self,
        node_count: usize,
        config_fn: F,
    ) -> Result<Vec<RpcClient>, SetupError>
    where
        F: FnMut(usize) -> Result<NodeConfig, ConfigError>,
    {
        if node_count == 0 {
            return Err(SetupError::NoNodes);
        }
        if !self.nodes.is_empty() {
            return Err(SetupError::AlreadyRunning(self.nodes.len()));
        }
        let configs = (0..node_count)
            .map(config_fn)
            .collect::<Result<Vec<_>, _>>()?;
        check_exclusive(&configs)?;
        self.topology = Topology::Joined;
        std::fs::create_dir_all(&self.harness.tmpdir).map_err(|source| SetupError::RunDir {
            path: self.harness.tmpdir.clone(),
            source,
        })?;

        info!("starting {node_count} node(s) under {}", self.harness.tmpdir.display());
        for config in configs {
            let index = config.index;
            match ProcessHandle::start(&self.harness, config) {
                Ok(handle) => self.nodes.push(handle),
                Err(source) => {
                    self.abort_setup().await;
                    return Err(SetupError::Launch { index, source });
                }
            }
        }

        let ready_timeout = self.harness.ready_timeout;
        let waits = self
            .nodes
            .iter_mut()
            .map(|node| node.wait_ready(ready_timeout));
        let first_failure = join_all(waits).await.into_iter().find_map(Result::err);
        if let Some(failure) = first_failure {
            self.abort_setup().await;
            return Err(failure.into());
        }
        info!("all {node_count} node(s) ready");
        Ok(self.clients())
    }

    /// Start `node_count` nodes wired by `topology`, each with its own
    /// `-exportdir`, plus `extra_args` on every node.
    pub async fn setup_with_topology(
        &mut self,
        node_count: usize,
        topology: Topology,
        extra_args: &[String],
    ) -> Result<Vec<RpcClient>, SetupError> {
        let harness = self.harness.clone();
        let clients = self
            .setup(node_count, |index| {
                Ok(harness
                    .node_config(index)?
                    .with_export_dir(&harness.node_export_dir(index))
                    .with_args(topology.connect_args(index, node_count, harness.port_seed))
                    .with_args(extra_args.iter().cloned()))
            })
            .await?;
        self.topology = topology;
        Ok(clients)
    }

    /// Wait until the nodes agree on their best block and then on the
    /// contents of their mempools. Nodes are only compared with the nodes
    /// the topology links them to, so the halves of a split network are
    /// synced separately.
    pub async fn sync_all(&self, wait: Duration) -> Result<(), SyncError> {
        let deadline = Instant::now() + wait;
        let poll_interval = self.harness.poll_interval;
        let clients = self.clients();
        for group in self.topology.groups(clients.len()) {
            let group = &clients[group];
            wait_for_agreement(group, "best block", deadline, poll_interval, |client| async move {
                client.getbestblockhash().await
            })
            .await?;
            wait_for_agreement(group, "mempool", deadline, poll_interval, |client| async move {
                let mut txids = client.getrawmempool().await?;
                txids.sort();
                Ok::<_, RpcError>(txids)
            })
            .await?;
        }
        Ok(())
    }

    async fn abort_setup(&mut self) {
        if let Err(report) = self.teardown().await {
            error!("while abandoning setup: {report}");
        }
    }

    /// Stop every node. A node that fails to stop is recorded and the rest
    /// are still stopped. Calling this again once everything is down is a
    /// no-op.
    pub async fn teardown(&mut self) -> Result<(), TeardownReport> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        info!("stopping {} node(s)", self.nodes.len());
        let grace = self.harness.shutdown_timeout;
        let stops = self.nodes.iter_mut().map(|node| node.stop(grace));
        let failures: Vec<ShutdownError> = join_all(stops)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        for failure in &failures {
            error!("{failure}");
        }
        self.nodes.clear();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownReport { failures })
        }
    }
}
