use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use regtestconfig::{HarnessConfig, PortSeed};
use zingo_regtest::process::LOCK_FILE_NAME;

static NEXT_SEED: AtomicU32 = AtomicU32::new(0);

pub fn stub_zcashd() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_stub-zcashd"))
}

/// A harness pointed at the stub node, on ports no other test in this binary
/// uses, with timeouts short enough for a test suite.
pub fn stub_harness(tmpdir: &Path) -> HarnessConfig {
    let mut harness = HarnessConfig::new(stub_zcashd(), tmpdir.to_path_buf());
    harness.port_seed =
        PortSeed::new(std::process::id().wrapping_add(NEXT_SEED.fetch_add(1, Ordering::SeqCst)));
    harness.ready_timeout = Duration::from_secs(10);
    harness.rpc_timeout = Duration::from_secs(5);
    harness.shutdown_timeout = Duration::from_secs(5);
    harness.poll_interval = Duration::from_millis(50);
    harness.scenario_timeout = Some(Duration::from_secs(60));
    harness
}

/// True while any node directory under `tmpdir` is still claimed.
pub fn any_node_claimed(tmpdir: &Path) -> bool {
    (0..regtestconfig::MAX_NODES).any(|index| {
        tmpdir
            .join(format!("node{index}"))
            .join(LOCK_FILE_NAME)
            .exists()
    })
}
