use crate::integration::{NetworkInvariants, TestHarness, TestResult};
use futures::future::join_all;
use ringkv_lib::messages;
use ringkv_lib::M;
use ringkv_node::SearchOutcome;

// Ring positions of the simulated ports used below (7-bit identifiers):
// 5000 -> 114, 5001 -> 79, 5002 -> 7, 5003 -> 105, 5004 -> 16
pub const PORT_A: u16 = 5000;
pub const PORT_B: u16 = 5001;
pub const PORT_C: u16 = 5002;

/// Ports 8001..=8014 hash to distinct identifiers
pub const LARGE_RING_BASE_PORT: u16 = 8001;
pub const LARGE_RING_MAX_NODES: usize = 14;

const MAX_ROUNDS: u32 = 30;

/// Common test scenarios for ring integration testing
pub struct TestScenarios;

fn ensure(condition: bool, message: impl Into<String>) -> TestResult {
    if condition {
        Ok(())
    } else {
        let message: String = message.into();
        Err(message.into())
    }
}

async fn ensure_invariants(harness: &TestHarness) -> TestResult {
    let violations = NetworkInvariants::check_all(harness).await;
    ensure(
        violations.is_empty(),
        format!("Invariant violations: {:?}", violations),
    )
}

impl TestScenarios {
    /// Builds a ring from `ports`, every node joining through the first one
    /// and the ring settling after each join.
    pub async fn build_ring(harness: &mut TestHarness, ports: &[u16]) -> TestResult<Vec<String>> {
        let mut addresses: Vec<String> = Vec::new();
        for &port in ports {
            let contact = addresses.first().cloned();
            let address = harness.add_and_join(port, contact.as_deref()).await?;
            addresses.push(address);
            harness.wait_for_stabilization(MAX_ROUNDS).await?;
        }
        Ok(addresses)
    }

    /// Three nodes join through the first one and form a consistent ring
    pub async fn basic_network_formation() -> TestResult {
        let mut harness = TestHarness::new();
        Self::build_ring(&mut harness, &[PORT_A, PORT_B, PORT_C]).await?;
        ensure_invariants(&harness).await
    }

    /// A, B and C on the ring, "foo" inserted, found everywhere, deleted
    /// through C and then missing through A
    pub async fn three_node_scenario() -> TestResult {
        let mut harness = TestHarness::new();
        let nodes = Self::build_ring(&mut harness, &[PORT_A, PORT_B, PORT_C]).await?;
        let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

        ensure(
            harness.insert(a, "foo", "bar").await? == messages::DONE,
            "insert through A failed",
        )?;
        harness.trigger_stabilization_round().await?;

        for via in [a, b, c] {
            let outcome = harness.search(via, "foo").await?;
            ensure(
                outcome == SearchOutcome::Found("bar".to_string()),
                format!("search through {} returned {:?}", via, outcome),
            )?;
        }
        // foo (51) belongs to B (79)
        let owner = harness.get_node(b).await.ok_or("B missing")?;
        ensure(owner.store.contains_key("foo"), "foo is not held by B")?;
        ensure_invariants(&harness).await?;

        ensure(
            harness.delete(c, "foo").await? == messages::DONE,
            "delete through C failed",
        )?;
        let outcome = harness.search(a, "foo").await?;
        ensure(
            outcome == SearchOutcome::NotFound,
            format!("search after delete returned {:?}", outcome),
        )?;
        ensure_invariants(&harness).await
    }

    /// Keys closer to a joining node move to it during bootstrap, before any
    /// stabilization, and leave the previous owner
    pub async fn join_migration() -> TestResult {
        let mut harness = TestHarness::new();
        let a = harness.add_and_join(PORT_A, None).await?;

        // banana=40, foo=51, apple=64, bar=77, delta=7 fall in (114, 79]; beta=101 does not
        let keys = ["banana", "foo", "apple", "bar", "delta", "beta"];
        for key in keys {
            harness.insert(&a, key, &format!("{}-value", key)).await?;
        }
        let node_a = harness.get_node(&a).await.ok_or("A missing")?;
        ensure(node_a.store.len() == keys.len(), "A should hold every key")?;

        let b = harness.add_and_join(PORT_B, Some(&a)).await?;
        let node_b = harness.get_node(&b).await.ok_or("B missing")?;

        for key in ["banana", "foo", "apple", "bar", "delta"] {
            ensure(
                node_b.store.search(key) == Some(format!("{}-value", key)),
                format!("{} did not move to B", key),
            )?;
            ensure(!node_a.store.contains_key(key), format!("{} still on A", key))?;
        }
        ensure(node_a.store.contains_key("beta"), "beta should stay on A")?;
        ensure(!node_b.store.contains_key("beta"), "beta moved to B")?;

        harness.wait_for_stabilization(MAX_ROUNDS).await?;
        ensure_invariants(&harness).await
    }

    /// Deletes succeed and stay deleted no matter which node routes them
    pub async fn delete_idempotence() -> TestResult {
        let mut harness = TestHarness::new();
        let nodes = Self::build_ring(&mut harness, &[PORT_A, PORT_B, PORT_C]).await?;

        for (i, key) in ["k1", "k2", "k3", "k4", "k5", "k6"].iter().enumerate() {
            let via = &nodes[i % nodes.len()];
            harness.insert(via, key, "v").await?;
        }

        for via in &nodes {
            ensure(
                harness.delete(via, "k3").await? == messages::DONE,
                format!("delete through {} failed", via),
            )?;
        }
        for via in &nodes {
            let outcome = harness.search(via, "k3").await?;
            ensure(
                outcome == SearchOutcome::NotFound,
                format!("k3 still visible through {}: {:?}", via, outcome),
            )?;
        }
        // Never-inserted keys delete fine too
        ensure(
            harness.delete(&nodes[0], "never-inserted").await? == messages::DONE,
            "deleting a missing key failed",
        )?;
        ensure_invariants(&harness).await
    }

    /// Several nodes join through the same contact at once, with no
    /// stabilization in between, and the ring still repairs itself
    pub async fn concurrent_joins() -> TestResult {
        let mut harness = TestHarness::new();
        let a = harness.add_and_join(PORT_A, None).await?;

        let mut joiners = Vec::new();
        for port in [PORT_B, PORT_C, 5003, 5004] {
            joiners.push(harness.add_node(port).await?);
        }
        let joins = joiners
            .iter()
            .map(|address| harness.connect_node_to_network(address, Some(&a)));
        for result in join_all(joins).await {
            result?;
        }

        // Every joiner starts out pointing at the lone contact
        for address in &joiners {
            let node = harness.get_node(address).await.ok_or("joiner missing")?;
            ensure(
                node.successor().socket_address() == a,
                format!("{} joined with successor {:?}", address, node.successor()),
            )?;
        }

        let rounds = harness.wait_for_stabilization(MAX_ROUNDS).await?;
        ensure(rounds > 1, "a single round cannot order four joiners")?;

        let nodes: Vec<String> = std::iter::once(a).chain(joiners).collect();
        for (i, key) in ["apple", "banana", "cherry", "delta", "gamma"].iter().enumerate() {
            harness.insert(&nodes[i % nodes.len()], key, "v").await?;
        }
        for via in &nodes {
            ensure(
                harness.search(via, "cherry").await? == SearchOutcome::Found("v".to_string()),
                format!("cherry not found through {}", via),
            )?;
        }
        ensure_invariants(&harness).await
    }

    /// Every key is reachable through every node
    pub async fn lookup_through_every_node() -> TestResult {
        let mut harness = TestHarness::new();
        let nodes =
            Self::build_ring(&mut harness, &[PORT_A, PORT_B, PORT_C, 5003, 5004]).await?;

        let keys: Vec<String> = (1..=10).map(|i| format!("k{}", i)).collect();
        for (i, key) in keys.iter().enumerate() {
            let via = &nodes[i % nodes.len()];
            harness.insert(via, key, &format!("value-{}", i)).await?;
        }

        for (i, key) in keys.iter().enumerate() {
            for via in &nodes {
                let outcome = harness.search(via, key).await?;
                ensure(
                    outcome == SearchOutcome::Found(format!("value-{}", i)),
                    format!("{} through {} returned {:?}", key, via, outcome),
                )?;
            }
        }
        ensure_invariants(&harness).await
    }

    /// A ring of `size` nodes converges, keeps every key at its owner and
    /// resolves lookups within `M` forwarding hops
    pub async fn scalability_test(size: usize) -> TestResult {
        ensure(
            size <= LARGE_RING_MAX_NODES,
            format!("at most {} distinct ring positions", LARGE_RING_MAX_NODES),
        )?;
        let mut harness = TestHarness::new();
        let ports: Vec<u16> = (0..size as u16).map(|i| LARGE_RING_BASE_PORT + i).collect();
        let nodes = Self::build_ring(&mut harness, &ports).await?;

        let keys: Vec<String> = (0..40).map(|i| format!("key-{}", i)).collect();
        for (i, key) in keys.iter().enumerate() {
            harness.insert(&nodes[i % nodes.len()], key, key).await?;
        }
        ensure_invariants(&harness).await?;

        for (i, key) in keys.iter().enumerate() {
            let via = &nodes[(i * 7) % nodes.len()];
            let before = harness.network().messages_delivered();
            let outcome = harness.search(via, key).await?;
            let messages = harness.network().messages_delivered() - before;

            ensure(
                outcome == SearchOutcome::Found(key.clone()),
                format!("{} through {} returned {:?}", key, via, outcome),
            )?;
            // Forwarding hops plus the final search_server
            ensure(
                messages <= M as u64 + 1,
                format!("lookup of {} took {} messages", key, messages),
            )?;
        }
        Ok(())
    }

    /// An unreachable owner surfaces as an error, never as a missing key
    pub async fn unreachable_owner() -> TestResult {
        let mut harness = TestHarness::new();
        let nodes = Self::build_ring(&mut harness, &[PORT_A, PORT_B, PORT_C]).await?;
        let (a, b) = (&nodes[0], &nodes[1]);

        harness.insert(a, "foo", "bar").await?;
        harness.fail_node(b).await?;

        let outcome = harness.search(a, "foo").await?;
        ensure(
            outcome == SearchOutcome::Unreachable,
            format!("search with owner down returned {:?}", outcome),
        )?;
        let node_a = harness.get_node(a).await.ok_or("A missing")?;
        ensure(
            node_a.dispatch_line("search|foo").await == messages::ERROR,
            "client reply should be the error token",
        )?;
        ensure(
            harness.insert(a, "fresh", "x").await? == messages::ERROR,
            "insert routed to a dead owner should fail",
        )?;

        // beta (101) belongs to A itself
        ensure(
            harness.insert(a, "beta", "b").await? == messages::DONE,
            "local insert should not need B",
        )?;

        harness.recover_node(b).await?;
        let outcome = harness.search(a, "foo").await?;
        ensure(
            outcome == SearchOutcome::Found("bar".to_string()),
            format!("search after recovery returned {:?}", outcome),
        )
    }
}
