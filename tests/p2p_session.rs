//! Two real nodes over localhost TCP: handshake, header sync, announcement.
//!
//! Node A listens and mines; node B dials A and must converge on A's chain
//! through the ordinary GETHEADERS/HEADERS flow.

use std::time::Duration;

use ember_node::{Hash160, Network, Node, NodeConfig};

fn node_config(datadir: &std::path::Path, listen_port: u16) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.network = Network::Regtest;
    config.datadir = datadir.to_path_buf();
    config.listen_enabled = listen_port != 0;
    config.listen_port = if listen_port != 0 { listen_port } else { 1 };
    config.connect_interval_secs = 1;
    config.maintenance_interval_secs = 1;
    config
}

fn free_port() -> u16 {
    // Bind-then-drop; the OS keeps the port free long enough for the node.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test(flavor = "multi_thread")]
async fn headers_sync_between_two_nodes() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let port = free_port();

    let node_a = Node::new(node_config(dir_a.path(), port)).unwrap();
    node_a.start().await.unwrap();

    // Mine a small chain on A before B ever shows up.
    let mined = node_a.generate(3, Hash160::new([7; 20])).unwrap();
    assert_eq!(mined.len(), 3);
    assert_eq!(node_a.get_block_count(), 3);

    let node_b = Node::new(node_config(dir_b.path(), 0)).unwrap();
    node_b.start().await.unwrap();
    node_b.add_node(&format!("127.0.0.1:{port}")).unwrap();

    // Wait for B to learn A's chain.
    let mut synced = false;
    for _ in 0..300 {
        if node_b.get_block_count() == 3 {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(synced, "node B never caught up to node A");
    assert_eq!(
        node_b.get_block_hash(3).unwrap(),
        node_a.get_block_hash(3).unwrap()
    );

    // Both sides show a live, completed connection.
    let peers_a = node_a.get_peer_info();
    let peers_b = node_b.get_peer_info();
    assert!(peers_a.iter().any(|p| p.inbound && p.ready));
    assert!(peers_b.iter().any(|p| !p.inbound && p.ready));

    // A mines one more; the announcement pulls B along.
    node_a.generate(1, Hash160::new([7; 20])).unwrap();
    let mut announced = false;
    for _ in 0..300 {
        if node_b.get_block_count() == 4 {
            announced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(announced, "tip announcement never reached node B");

    node_b.stop();
    node_a.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn generate_is_regtest_only_and_mocktime_guarded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path(), 0);
    config.network = Network::Regtest;
    let node = Node::new(config).unwrap();

    // Regtest: both verbs work.
    node.set_mock_time(1_700_000_000).unwrap();
    let mined = node.generate(2, Hash160::ZERO).unwrap();
    assert_eq!(mined.len(), 2);
    assert_eq!(node.get_block_count(), 2);
    assert!(node.generate(0, Hash160::ZERO).is_err());

    let info = node.get_info();
    assert_eq!(info.height, 2);
    assert_eq!(info.best_hash, Some(mined[1]));

    // Chain queries are range-checked.
    assert!(node.get_block_hash(2).is_ok());
    assert!(node.get_block_hash(3).is_err());
    assert!(node.get_network_hashps(0).is_err());
    assert!(node.get_network_hashps(120).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn mainnet_refuses_test_only_verbs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path(), 0);
    config.network = Network::Main;
    let node = Node::new(config).unwrap();
    assert!(node.generate(1, Hash160::ZERO).is_err());
    assert!(node.set_mock_time(1_700_000_000).is_err());
}
