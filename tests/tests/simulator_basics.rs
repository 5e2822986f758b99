//! Tests for the simulation framework itself

use ringkv_integration_tests::integration::{NetworkSimulator, TestHarness};
use ringkv_node::{NetworkClient, Request, RpcError, SearchOutcome};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_basic_test_harness_operations() {
    let mut harness = TestHarness::new();

    let node1 = harness.add_node(5000).await.expect("Failed to add node1");
    let node2 = harness.add_node(5001).await.expect("Failed to add node2");

    let addresses = harness.get_all_node_addresses().await;
    assert_eq!(addresses.len(), 2);
    assert!(addresses.contains(&node1));
    assert!(addresses.contains(&node2));

    let node = harness.get_node(&node1).await.unwrap();
    assert_eq!(node.info.id, 114);
    assert_eq!(node1, "127.0.0.1:5000");
}

#[tokio::test]
async fn test_identifier_collisions_are_rejected() {
    let mut harness = TestHarness::new();
    harness.add_node(5005).await.unwrap();
    // 5006 hashes to 65 as well
    assert!(harness.add_node(5006).await.is_err());
    assert!(harness.add_node(5005).await.is_err());
}

#[tokio::test]
async fn test_network_simulator_routing() {
    let simulator = NetworkSimulator::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    simulator.register_node("127.0.0.1:8001".to_string(), tx).await;
    assert!(simulator.is_node_registered("127.0.0.1:8001").await);
    assert!(!simulator.is_node_registered("127.0.0.1:8002").await);

    // Answer every request with its wire form
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let _ = message.reply_sender.send(message.request.to_string());
        }
    });

    let client = simulator.create_client("127.0.0.1:8000".to_string());
    let reply = client
        .call_node("127.0.0.1:8001", Request::GetSuccessor)
        .await
        .unwrap();
    assert_eq!(reply, "get_successor");
    assert_eq!(simulator.messages_delivered(), 1);

    simulator.mark_node_failed("127.0.0.1:8001").await;
    let result = client.call_node("127.0.0.1:8001", Request::GetSuccessor).await;
    assert!(matches!(result, Err(RpcError::Unreachable { .. })));

    simulator.mark_node_recovered("127.0.0.1:8001").await;
    simulator.set_latency(10).await;
    assert!(client
        .call_node("127.0.0.1:8001", Request::GetPredecessor)
        .await
        .is_ok());

    // Unknown nodes are unreachable, not silent
    let result = client.call_node("127.0.0.1:8002", Request::GetSuccessor).await;
    assert!(matches!(result, Err(RpcError::Unreachable { .. })));
}

#[tokio::test]
async fn test_two_node_ring() {
    let mut harness = TestHarness::new();
    let a = harness.add_and_join(5000, None).await.unwrap();
    let b = harness.add_and_join(5001, Some(&a)).await.unwrap();

    let rounds = harness.wait_for_stabilization(10).await.unwrap();
    assert!(rounds <= 3, "took {} rounds", rounds);

    let node_a = harness.get_node(&a).await.unwrap();
    let node_b = harness.get_node(&b).await.unwrap();
    assert_eq!(node_a.successor(), node_b.info);
    assert_eq!(node_b.successor(), node_a.info);
    assert_eq!(node_a.predecessor(), Some(node_b.info.clone()));
    assert_eq!(node_b.predecessor(), Some(node_a.info.clone()));
}

#[tokio::test]
async fn test_single_node_serves_everything() {
    let mut harness = TestHarness::new();
    let a = harness.add_and_join(5000, None).await.unwrap();

    assert_eq!(harness.insert(&a, "alpha", "1").await.unwrap(), "Done");
    assert_eq!(
        harness.search(&a, "alpha").await.unwrap(),
        SearchOutcome::Found("1".to_string())
    );
    assert_eq!(harness.delete(&a, "alpha").await.unwrap(), "Done");
    assert_eq!(
        harness.search(&a, "alpha").await.unwrap(),
        SearchOutcome::NotFound
    );
    assert_eq!(harness.network().messages_delivered(), 0);
}
