//! Launching and supervising one node process.
use std::{
    fs::{File, OpenOptions},
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use log::{debug, info, warn};
use regtestconfig::{ports, HarnessConfig, NodeConfig};
use tokio::{
    process::{Child, Command},
    time::{sleep, timeout, timeout_at, Instant},
};

use crate::rpc::{RpcClient, RpcError};

/// Marks a data directory as claimed by a live handle.
pub const LOCK_FILE_NAME: &str = ".regtest.lock";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("data directory {0} is already claimed by a running node")]
    DataDirInUse(PathBuf),
    #[error("port {port} for node {index} is already bound")]
    PortInUse { index: usize, port: u16 },
    #[error("could not prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReadyError {
    #[error("node {index} was not ready after {waited:?}")]
    Timeout { index: usize, waited: Duration },
    #[error("node {index} exited during initialization with {status}")]
    Crashed { index: usize, status: ExitStatus },
    #[error("node {index} cannot become ready from state {state:?}")]
    NotStarting { index: usize, state: NodeState },
    #[error("could not poll node {index}: {source}")]
    Io {
        index: usize,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("node {index} exited with {status} after being asked to stop")]
    UncleanExit { index: usize, status: ExitStatus },
    #[error("node {index} could not be killed: {source}")]
    Kill {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("could not wait on node {index}: {source}")]
    Wait {
        index: usize,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle of a node. A handle only ever moves forward through these;
/// `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl NodeState {
    fn can_become(&self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Starting, Ready) | (Starting, Failed) | (Starting, Stopped)
                | (Ready, Failed) | (Ready, Stopped)
                | (Failed, Stopped)
        )
    }
}

/// One running node: its child process, its lock on the data directory and
/// its rpc client.
#[derive(Debug)]
pub struct ProcessHandle {
    config: NodeConfig,
    child: Option<Child>,
    pid: Option<u32>,
    state: NodeState,
    rpc: RpcClient,
    poll_interval: Duration,
    lock_path: PathBuf,
}

fn prepare(path: PathBuf) -> Result<PathBuf, LaunchError> {
    std::fs::create_dir_all(&path).map_err(|source| LaunchError::Prepare {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn create_file(path: PathBuf) -> Result<File, LaunchError> {
    File::create(&path).map_err(|source| LaunchError::Prepare { path, source })
}

impl ProcessHandle {
    /// Prepare `config`'s directories, write its zcash.conf and spawn the
    /// node. Returns as soon as the process exists; see [`Self::wait_ready`].
    pub fn start(harness: &HarnessConfig, config: NodeConfig) -> Result<Self, LaunchError> {
        let data_dir = prepare(config.data_dir.clone())?;
        let lock_path = data_dir.join(LOCK_FILE_NAME);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LaunchError::DataDirInUse(data_dir))
            }
            Err(source) => {
                return Err(LaunchError::Prepare {
                    path: lock_path,
                    source,
                })
            }
        }
        // From here on a failure must release the lock again.
        match Self::spawn(harness, config, lock_path.clone()) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let _ = std::fs::remove_file(&lock_path);
                Err(e)
            }
        }
    }

    fn spawn(
        harness: &HarnessConfig,
        config: NodeConfig,
        lock_path: PathBuf,
    ) -> Result<Self, LaunchError> {
        let index = config.index;
        for port in [config.p2p_port, config.rpc_port] {
            if !ports::is_free(port) {
                return Err(LaunchError::PortInUse { index, port });
            }
        }
        if let Some(export_dir) = config.export_dir() {
            prepare(export_dir)?;
        }
        let conf_path = config.conf_path();
        std::fs::write(&conf_path, harness.render_conf(&config)).map_err(|source| {
            LaunchError::Prepare {
                path: conf_path.clone(),
                source,
            }
        })?;
        let stdout = create_file(config.data_dir.join("stdout.log"))?;
        let stderr = create_file(config.data_dir.join("stderr.log"))?;

        let rpc = RpcClient::new(&config, harness.rpc_timeout, harness.trace_rpc)?;
        let child = Command::new(&harness.zcashd_bin)
            .args(config.command_args())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                binary: harness.zcashd_bin.clone(),
                source,
            })?;
        let pid = child.id();
        info!(
            "node{index} starting, pid {}, rpc on {}",
            pid.map(|p| p.to_string()).unwrap_or_default(),
            rpc.url()
        );
        Ok(Self {
            config,
            child: Some(child),
            pid,
            state: NodeState::Starting,
            rpc,
            poll_interval: harness.poll_interval,
            lock_path,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn index(&self) -> usize {
        self.config.index
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn advance(&mut self, next: NodeState) {
        if self.state.can_become(next) {
            debug!("node{} {:?} -> {:?}", self.index(), self.state, next);
            self.state = next;
        } else {
            warn!(
                "node{} ignoring transition {:?} -> {:?}",
                self.index(),
                self.state,
                next
            );
        }
    }

    /// Poll the node with `getblockcount` until it answers, exits, or
    /// `wait` elapses. Warm-up errors and refused connections mean "not yet".
    pub async fn wait_ready(&mut self, wait: Duration) -> Result<(), ReadyError> {
        let index = self.index();
        if self.state == NodeState::Ready {
            return Ok(());
        }
        if self.state != NodeState::Starting {
            return Err(ReadyError::NotStarting {
                index,
                state: self.state,
            });
        }
        let started = Instant::now();
        let deadline = started + wait;
        loop {
            let exited = match self.child.as_mut() {
                Some(child) => child
                    .try_wait()
                    .map_err(|source| ReadyError::Io { index, source })?,
                None => None,
            };
            if let Some(status) = exited {
                self.advance(NodeState::Failed);
                return Err(ReadyError::Crashed { index, status });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let probed = timeout(remaining, self.rpc.probe("getblockcount", &[], remaining)).await;
            match probed {
                Ok(Ok(_)) => {
                    self.advance(NodeState::Ready);
                    self.rpc.set_usable(true);
                    info!("node{index} ready after {:?}", started.elapsed());
                    return Ok(());
                }
                Ok(Err(e)) if e.is_warmup() => debug!("node{index} warming up"),
                Ok(Err(RpcError::Connection { .. })) | Ok(Err(RpcError::Timeout { .. })) => {}
                Ok(Err(e)) => debug!("node{index} not ready: {e}"),
                Err(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                self.advance(NodeState::Failed);
                return Err(ReadyError::Timeout {
                    index,
                    waited: now - started,
                });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Ask the node to stop over rpc, give it `grace` to exit, then kill it.
    /// Stopping a stopped handle does nothing.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), ShutdownError> {
        let index = self.index();
        self.rpc.set_usable(false);
        let Some(mut child) = self.child.take() else {
            if self.state != NodeState::Stopped {
                self.advance(NodeState::Stopped);
            }
            return Ok(());
        };
        let was_ready = self.state == NodeState::Ready;
        let result = Self::shut_down(index, &self.rpc, &mut child, grace, was_ready).await;
        self.pid = None;
        self.advance(NodeState::Stopped);
        self.release_lock();
        result
    }

    async fn shut_down(
        index: usize,
        rpc: &RpcClient,
        child: &mut Child,
        grace: Duration,
        was_ready: bool,
    ) -> Result<(), ShutdownError> {
        let already_exited = child
            .try_wait()
            .map_err(|source| ShutdownError::Wait { index, source })?;
        if let Some(status) = already_exited {
            debug!("node{index} had already exited with {status}");
            return Ok(());
        }
        // one deadline covers both the request and the exit
        let deadline = Instant::now() + grace;
        match timeout_at(deadline, rpc.stop(grace)).await {
            Ok(Ok(reply)) => debug!("node{index}: {reply}"),
            Ok(Err(e)) => debug!("node{index} stop request failed: {e}"),
            Err(_) => debug!("node{index} did not answer stop"),
        }
        match timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) if status.success() || !was_ready => {
                info!("node{index} stopped");
                Ok(())
            }
            Ok(Ok(status)) => Err(ShutdownError::UncleanExit { index, status }),
            Ok(Err(source)) => Err(ShutdownError::Wait { index, source }),
            Err(_) => {
                warn!("node{index} still running after {grace:?}, killing it");
                child
                    .kill()
                    .await
                    .map_err(|source| ShutdownError::Kill { index, source })
            }
        }
    }

    fn release_lock(&self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("could not release {}: {e}", self.lock_path.display());
            }
        }
    }
}

/// A handle dropped while its node runs kills the child (it is spawned with
/// `kill_on_drop`) but cannot wait for the exit, so the lock file stays
/// behind and the data directory remains claimed. Only [`ProcessHandle::stop`]
/// releases it.
impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!(
                "node{} dropped while running, killing it and leaving {} in place",
                self.index(),
                self.lock_path.display()
            );
            self.rpc.set_usable(false);
        }
    }
}
