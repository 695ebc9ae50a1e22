#![forbid(unsafe_code)]
mod utils;

use std::time::{Duration, Instant};

use regtestconfig::{nuparams, NetworkUpgrade, Topology};
use utils::{any_node_claimed, stub_harness};
use zingo_regtest::{
    network::{RegtestNetwork, SetupError, SyncError},
    process::{LaunchError, NodeState, ProcessHandle, ReadyError, ShutdownError},
    rpc::{Rescan, RpcError, ShieldedPool, RPC_WALLET_ERROR},
};

#[tokio::test]
async fn setup_hands_out_one_ready_client_per_node() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    let clients = network
        .setup_with_topology(3, Topology::Joined, &[])
        .await
        .unwrap();
    assert_eq!(clients.len(), 3);
    assert_eq!(network.running_count(), 3);
    for (index, client) in clients.iter().enumerate() {
        assert_eq!(client.node_index(), index);
        assert!(client.is_usable());
        assert_eq!(client.getblockcount().await.unwrap(), 0);
    }
    assert!(network
        .nodes()
        .iter()
        .all(|node| node.state() == NodeState::Ready));
    network.teardown().await.unwrap();
    assert_eq!(network.running_count(), 0);
}

#[tokio::test]
async fn clients_are_dead_after_teardown_and_teardown_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    let clients = network.setup_with_topology(1, Topology::Joined, &[]).await.unwrap();
    network.teardown().await.unwrap();
    network.teardown().await.unwrap();
    assert!(!clients[0].is_usable());
    assert!(matches!(
        clients[0].z_getnewaddress(ShieldedPool::Sapling).await,
        Err(RpcError::Connection { .. })
    ));
    assert!(!any_node_claimed(dir.path()));
}

#[tokio::test]
async fn export_then_import_round_trips_and_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    let clients = network.setup_with_topology(1, Topology::Joined, &[]).await.unwrap();
    let node = &clients[0];
    let address = node.z_getnewaddress(ShieldedPool::Sapling).await.unwrap();
    let key = node.z_exportkey(&address).await.unwrap();
    let first = node.z_importkey(&key).await.unwrap();
    let second = node.z_importkey(&key).await.unwrap();
    assert_eq!(first.map(|k| k.address), Some(address.clone()));
    assert_eq!(second.map(|k| k.address), Some(address.clone()));
    assert_eq!(node.z_listaddresses().await.unwrap(), vec![address]);
    network.teardown().await.unwrap();
}

#[tokio::test]
async fn warming_up_nodes_are_waited_for() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    let started = Instant::now();
    let clients = network
        .setup_with_topology(2, Topology::Joined, &["-stubwarmupms=400".to_string()])
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(clients[1].getblockcount().await.unwrap(), 0);
    network.teardown().await.unwrap();
}

#[tokio::test]
async fn never_ready_node_times_out_within_its_bound() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = stub_harness(dir.path());
    harness.poll_interval = Duration::from_millis(100);
    let config = harness
        .node_config(0)
        .unwrap()
        .with_arg("-stubneverready");
    let mut node = ProcessHandle::start(&harness, config).unwrap();
    let bound = Duration::from_millis(600);
    let started = Instant::now();
    let result = node.wait_ready(bound).await;
    let waited = started.elapsed();
    assert!(matches!(result, Err(ReadyError::Timeout { index: 0, .. })));
    assert!(waited >= bound);
    assert!(waited < bound + harness.poll_interval + Duration::from_millis(500));
    assert_eq!(node.state(), NodeState::Failed);
    node.stop(Duration::from_millis(300)).await.unwrap();
    assert_eq!(node.state(), NodeState::Stopped);
    assert!(!node.is_running());
}

#[tokio::test]
async fn crash_before_ready_carries_the_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let harness = stub_harness(dir.path());
    let config = harness
        .node_config(0)
        .unwrap()
        .with_arg("-stubexitcode=3");
    let mut node = ProcessHandle::start(&harness, config).unwrap();
    match node.wait_ready(Duration::from_secs(10)).await {
        Err(ReadyError::Crashed { index, status }) => {
            assert_eq!(index, 0);
            assert_eq!(status.code(), Some(3));
        }
        other => panic!("expected a crash, got {other:?}"),
    }
    node.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn one_crashing_node_leaves_nothing_running() {
    let dir = tempfile::tempdir().unwrap();
    let harness = stub_harness(dir.path());
    let mut network = RegtestNetwork::new(harness.clone());
    let result = network
        .setup(3, |index| {
            let config = harness.node_config(index)?;
            Ok(if index == 1 {
                config.with_arg("-stubexitcode=2")
            } else {
                config.with_arg("-stubwarmupms=200")
            })
        })
        .await;
    assert!(matches!(
        result,
        Err(SetupError::NotReady(ReadyError::Crashed { index: 1, .. }))
    ));
    assert_eq!(network.running_count(), 0);
    assert!(network.nodes().is_empty());
    assert!(!any_node_claimed(dir.path()));
}

#[tokio::test]
async fn node_ignoring_stop_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = stub_harness(dir.path());
    harness.shutdown_timeout = Duration::from_millis(500);
    let mut network = RegtestNetwork::new(harness);
    network
        .setup_with_topology(1, Topology::Joined, &["-stubignorestop".to_string()])
        .await
        .unwrap();
    let started = Instant::now();
    network.teardown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(network.running_count(), 0);
}

#[tokio::test]
async fn unclean_exit_is_reported_but_every_node_is_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let harness = stub_harness(dir.path());
    let mut network = RegtestNetwork::new(harness.clone());
    network
        .setup(2, |index| {
            let config = harness.node_config(index)?;
            Ok(if index == 0 {
                config.with_arg("-stubstopexitcode=4")
            } else {
                config
            })
        })
        .await
        .unwrap();
    let report = network.teardown().await.unwrap_err();
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        report.failures[0],
        ShutdownError::UncleanExit { index: 0, .. }
    ));
    assert_eq!(network.running_count(), 0);
    assert!(!any_node_claimed(dir.path()));
}

#[tokio::test]
async fn split_topology_leaves_the_halves_unlinked() {
    let dir = tempfile::tempdir().unwrap();
    let harness = stub_harness(dir.path());
    let mut network = RegtestNetwork::new(harness.clone());
    network
        .setup_with_topology(4, Topology::Split, &[])
        .await
        .unwrap();
    let connects: Vec<Vec<String>> = network
        .nodes()
        .iter()
        .map(|node| {
            node.config()
                .extra_args
                .iter()
                .filter(|arg| arg.starts_with("-connect="))
                .cloned()
                .collect()
        })
        .collect();
    assert!(connects[0].is_empty());
    assert_eq!(
        connects[1],
        [format!("-connect=127.0.0.1:{}", harness.port_seed.p2p_port(0))]
    );
    assert!(connects[2].is_empty());
    assert_eq!(
        connects[3],
        [format!("-connect=127.0.0.1:{}", harness.port_seed.p2p_port(2))]
    );
    network.teardown().await.unwrap();
}

#[tokio::test]
async fn second_setup_while_running_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    network.setup_with_topology(1, Topology::Joined, &[]).await.unwrap();
    assert!(matches!(
        network.setup_with_topology(1, Topology::Joined, &[]).await,
        Err(SetupError::AlreadyRunning(1))
    ));
    network.teardown().await.unwrap();
}

#[tokio::test]
async fn bound_rpc_port_is_refused_at_launch() {
    let dir = tempfile::tempdir().unwrap();
    let harness = stub_harness(dir.path());
    let _squatter = std::net::TcpListener::bind(("0.0.0.0", harness.port_seed.rpc_port(0))).unwrap();
    let mut network = RegtestNetwork::new(harness);
    let result = network.setup_with_topology(1, Topology::Joined, &[]).await;
    assert!(matches!(
        result,
        Err(SetupError::Launch {
            index: 0,
            source: LaunchError::PortInUse { .. }
        })
    ));
    assert!(!any_node_claimed(dir.path()));
}

#[tokio::test]
async fn stop_of_a_silent_node_is_bounded_by_its_grace() {
    let dir = tempfile::tempdir().unwrap();
    let harness = stub_harness(dir.path());
    let config = harness.node_config(0).unwrap().with_arg("-stubhangonstop");
    let mut node = ProcessHandle::start(&harness, config).unwrap();
    node.wait_ready(Duration::from_secs(10)).await.unwrap();
    let grace = Duration::from_secs(1);
    let started = Instant::now();
    node.stop(grace).await.unwrap();
    let took = started.elapsed();
    assert!(took >= grace);
    assert!(
        took < grace + Duration::from_millis(500),
        "stop({grace:?}) took {took:?}"
    );
    assert!(!node.is_running());
    assert!(!any_node_claimed(dir.path()));
}

#[tokio::test]
async fn dropped_handle_keeps_its_directory_claimed() {
    let dir = tempfile::tempdir().unwrap();
    let harness = stub_harness(dir.path());
    let config = harness.node_config(0).unwrap();
    let mut node = ProcessHandle::start(&harness, config.clone()).unwrap();
    node.wait_ready(Duration::from_secs(10)).await.unwrap();
    drop(node);
    assert!(any_node_claimed(dir.path()));
    assert!(matches!(
        ProcessHandle::start(&harness, config),
        Err(LaunchError::DataDirInUse(_))
    ));
}

#[tokio::test]
async fn stop_request_shuts_the_node_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    let clients = network.setup_with_topology(1, Topology::Joined, &[]).await.unwrap();
    assert_eq!(
        clients[0].stop(Duration::from_secs(5)).await.unwrap(),
        "Zcash server stopping"
    );
    network.teardown().await.unwrap();
    assert!(!any_node_claimed(dir.path()));
}

#[tokio::test]
async fn keys_stay_with_the_wallet_that_made_them() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    let clients = network.setup_with_topology(2, Topology::Joined, &[]).await.unwrap();
    let address = clients[0].z_getnewaddress(ShieldedPool::Sapling).await.unwrap();
    match clients[1].z_exportkey(&address).await {
        Err(e) => assert_eq!(e.code(), Some(RPC_WALLET_ERROR)),
        Ok(_) => panic!("node 1 exported a key it never held"),
    }
    let key = clients[0].z_exportkey(&address).await.unwrap();
    let imported = clients[1]
        .z_importkey_with_rescan(&key, Rescan::No, 0)
        .await
        .unwrap();
    assert_eq!(imported.map(|k| k.address), Some(address.clone()));
    assert_eq!(clients[1].z_listaddresses().await.unwrap(), vec![address]);
    network.teardown().await.unwrap();
}

#[tokio::test]
async fn agreeing_nodes_sync() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    network
        .setup_with_topology(
            3,
            Topology::Joined,
            &["-stubmempool=feed".to_string(), "-stubmempool=beef".to_string()],
        )
        .await
        .unwrap();
    network.sync_all(Duration::from_secs(2)).await.unwrap();
    network.teardown().await.unwrap();
}

#[tokio::test]
async fn diverged_tips_are_reported_after_the_bound() {
    let dir = tempfile::tempdir().unwrap();
    let harness = stub_harness(dir.path());
    let mut network = RegtestNetwork::new(harness.clone());
    network
        .setup(2, |index| {
            let config = harness.node_config(index)?;
            Ok(if index == 1 {
                config.with_arg("-stubbestblockhash=00000000000000000000000000000000000000000000000000000000000000ff")
            } else {
                config
            })
        })
        .await
        .unwrap();
    let bound = Duration::from_millis(500);
    let started = Instant::now();
    match network.sync_all(bound).await {
        Err(SyncError::Diverged { what, nodes, .. }) => {
            assert_eq!(what, "best block");
            assert_eq!(nodes, [0, 1]);
        }
        other => panic!("expected divergence, got {other:?}"),
    }
    assert!(started.elapsed() >= bound);
    network.teardown().await.unwrap();
}

#[tokio::test]
async fn diverged_mempools_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let harness = stub_harness(dir.path());
    let mut network = RegtestNetwork::new(harness.clone());
    network
        .setup(2, |index| {
            let config = harness.node_config(index)?;
            Ok(if index == 0 {
                config.with_arg("-stubmempool=feed")
            } else {
                config
            })
        })
        .await
        .unwrap();
    assert!(matches!(
        network.sync_all(Duration::from_millis(200)).await,
        Err(SyncError::Diverged { what: "mempool", .. })
    ));
    network.teardown().await.unwrap();
}

#[tokio::test]
async fn scheduled_upgrades_reach_the_node() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    let upgrades = [
        nuparams(NetworkUpgrade::Blossom, 205),
        nuparams(NetworkUpgrade::Heartwood, 205),
        nuparams(NetworkUpgrade::Canopy, 205),
        nuparams(NetworkUpgrade::Nu5, 210),
    ];
    network
        .setup_with_topology(2, Topology::Joined, &upgrades)
        .await
        .unwrap();
    for node in network.nodes() {
        assert!(node.config().extra_args.contains(&"-nuparams=c2d6d0b4:210".to_string()));
    }
    network.teardown().await.unwrap();
}

#[tokio::test]
async fn malformed_upgrade_argument_fails_setup() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = RegtestNetwork::new(stub_harness(dir.path()));
    let result = network
        .setup_with_topology(1, Topology::Joined, &["-nuparams=nonsense".to_string()])
        .await;
    assert!(matches!(
        result,
        Err(SetupError::NotReady(ReadyError::Crashed { index: 0, .. }))
    ));
    assert!(!any_node_claimed(dir.path()));
}
