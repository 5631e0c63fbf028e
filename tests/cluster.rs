//! Integration tests for sharded cluster topologies. Cluster formation
//! involves gossip convergence, so these tests run longer than the rest.

mod common;

use std::time::Duration;

use anyhow::Result;
use redbed::harness::{RedisHarness, TopologyConfig};
use redbed::topology::{ShardConfig, ShardedClusterConfig, Topology};

fn two_shard_config() -> ShardedClusterConfig {
    ShardedClusterConfig {
        shards: vec![
            ShardConfig {
                name: "alpha".to_string(),
                replicas: 1,
            },
            ShardConfig {
                name: "beta".to_string(),
                replicas: 1,
            },
        ],
        initialization_timeout: Duration::from_secs(60),
        ..Default::default()
    }
}

#[tokio::test]
async fn cluster_converges_and_serves_requests() -> Result<()> {
    common::init_tracing();
    if !common::redis_server_available() {
        eprintln!("skipping: no redis-server binary on PATH");
        return Ok(());
    }

    let harness = RedisHarness::new();
    let redis = harness
        .provision(
            "cluster-basic",
            TopologyConfig::ShardedCluster(two_shard_config()),
        )
        .await?;

    // 2 shards with 1 replica each is 4 nodes.
    assert_eq!(redis.topology.ports().len(), 4);

    let Topology::ShardedCluster(topology) = &redis.topology else {
        unreachable!()
    };
    assert_eq!(topology.shards.len(), 2);
    for shard in &topology.shards {
        assert_eq!(shard.replicas.len(), 1);
        assert!(shard.primary.active().await);
    }

    redis.client.ping().await?;
    // Keys hash to different slots, so both shards see traffic.
    for i in 0..20 {
        redis.client.set(&format!("key-{i}"), "value").await?;
    }
    assert_eq!(redis.client.get("key-0").await?, Some("value".to_string()));
    assert_eq!(redis.client.get("key-19").await?, Some("value".to_string()));

    harness.teardown("cluster-basic").await;
    Ok(())
}

#[tokio::test]
async fn explicit_ports_follow_shard_order() -> Result<()> {
    common::init_tracing();
    if !common::redis_server_available() {
        eprintln!("skipping: no redis-server binary on PATH");
        return Ok(());
    }

    let ports: Vec<u16> = {
        let listeners: Vec<std::net::TcpListener> = (0..4)
            .map(|_| std::net::TcpListener::bind(("127.0.0.1", 0)))
            .collect::<std::io::Result<_>>()?;
        listeners
            .iter()
            .map(|l| l.local_addr().map(|a| a.port()))
            .collect::<std::io::Result<_>>()?
    };

    let config = ShardedClusterConfig {
        ports: ports.clone(),
        ..two_shard_config()
    };

    let harness = RedisHarness::new();
    let redis = harness
        .provision("cluster-explicit-ports", TopologyConfig::ShardedCluster(config))
        .await?;

    let Topology::ShardedCluster(topology) = &redis.topology else {
        unreachable!()
    };
    // Shard order, primary before replicas.
    assert_eq!(topology.shards[0].primary.port(), ports[0]);
    assert_eq!(topology.shards[0].replicas[0].port(), ports[1]);
    assert_eq!(topology.shards[1].primary.port(), ports[2]);
    assert_eq!(topology.shards[1].replicas[0].port(), ports[3]);

    harness.teardown("cluster-explicit-ports").await;
    Ok(())
}

#[tokio::test]
async fn teardown_stops_every_node() -> Result<()> {
    common::init_tracing();
    if !common::redis_server_available() {
        eprintln!("skipping: no redis-server binary on PATH");
        return Ok(());
    }

    let harness = RedisHarness::new();
    let redis = harness
        .provision(
            "cluster-teardown",
            TopologyConfig::ShardedCluster(two_shard_config()),
        )
        .await?;

    let servers = redis.topology.servers();
    harness.teardown("cluster-teardown").await;
    for server in &servers {
        assert!(!server.active().await, "port {} still active", server.port());
    }
    Ok(())
}
