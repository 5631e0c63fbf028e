//! Sharded cluster topologies: cluster-mode nodes, slot assignment and
//! bounded convergence wait.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::{debug, info};

use crate::address;
use crate::error::{Error, Result};
use crate::names;
use crate::ports::PortAllocator;
use crate::server::{DEFAULT_BIND, RedisServer, RedisServerBuilder};
use crate::topology::{ReplicationGroup, resolve_ports, rollback};

/// Total number of hash slots in a Redis cluster.
const SLOTS: u16 = 16384;

const CLUSTER_NODE_TIMEOUT_MS: u32 = 5000;

/// Configuration of one shard.
#[derive(Clone)]
pub struct ShardConfig {
    /// Shard name; empty means a name is drawn from the name pool.
    pub name: String,
    /// Number of replicas; must be at least 1.
    pub replicas: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            replicas: 2,
        }
    }
}

/// Customizes the shard builders before the nodes are launched. Methods
/// default to no-ops.
pub trait ShardCustomizer: Send + Sync {
    fn customize_main_node(
        &self,
        _builder: &mut RedisServerBuilder,
        _config: &ShardedClusterConfig,
        _shard: &str,
    ) {
    }

    fn customize_replicas(
        &self,
        _builders: &mut [RedisServerBuilder],
        _config: &ShardedClusterConfig,
        _shard: &str,
    ) {
    }
}

/// Configuration of a sharded cluster topology.
#[derive(Clone)]
pub struct ShardedClusterConfig {
    pub shards: Vec<ShardConfig>,
    /// Ports for all nodes in shard order, each shard's primary before its
    /// replicas. Empty for a fresh allocation; `0` entries are replaced by
    /// fresh allocations. If non-empty, the length must be the total node
    /// count.
    pub ports: Vec<u16>,
    /// Upper bound for cluster formation (gossip and slot-assignment
    /// convergence).
    pub initialization_timeout: Duration,
    /// Customizers, invoked in array order.
    pub customizers: Vec<Arc<dyn ShardCustomizer>>,
}

impl Default for ShardedClusterConfig {
    fn default() -> Self {
        Self {
            shards: vec![ShardConfig::default()],
            ports: Vec::new(),
            initialization_timeout: Duration::from_secs(20),
            customizers: Vec::new(),
        }
    }
}

impl ShardedClusterConfig {
    fn node_count(&self) -> usize {
        self.shards.iter().map(|s| s.replicas + 1).sum()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::Validation("Shards must not be empty".to_string()));
        }
        // Each shard primary needs at least one hash slot.
        if self.shards.len() > SLOTS as usize {
            return Err(Error::Validation(format!(
                "Shards must not exceed the number of hash slots ({SLOTS})"
            )));
        }
        if self.shards.iter().any(|s| s.replicas == 0) {
            return Err(Error::Validation(
                "Replicas for all shards must be greater than 0".to_string(),
            ));
        }
        if !self.ports.is_empty() && self.ports.len() != self.node_count() {
            return Err(Error::Validation(
                "If ports are specified, they must match the number of nodes".to_string(),
            ));
        }
        let explicit: Vec<u16> = self.ports.iter().copied().filter(|&p| p != 0).collect();
        let unique: BTreeSet<u16> = explicit.iter().copied().collect();
        if unique.len() != explicit.len() {
            return Err(Error::Validation(
                "Ports must not be specified more than once".to_string(),
            ));
        }
        if self.initialization_timeout.is_zero() {
            return Err(Error::Validation(
                "Initialization timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct ShardedClusterTopology {
    pub shards: Vec<ReplicationGroup>,
}

pub async fn build(
    config: &ShardedClusterConfig,
    ports: &PortAllocator,
) -> Result<ShardedClusterTopology> {
    config.validate()?;

    let manually_specified: BTreeSet<u16> =
        config.ports.iter().copied().filter(|&p| p != 0).collect();
    let node_ports = resolve_ports(
        &config.ports,
        config.node_count(),
        ports,
        &manually_specified,
        false,
    )?;

    let mut started = Vec::new();
    match build_inner(config, node_ports, &mut started).await {
        Ok(topology) => Ok(topology),
        Err(e) => {
            rollback(&started).await;
            Err(e)
        }
    }
}

async fn build_inner(
    config: &ShardedClusterConfig,
    node_ports: Vec<u16>,
    started: &mut Vec<Arc<RedisServer>>,
) -> Result<ShardedClusterTopology> {
    let mut ports = node_ports.into_iter();
    let mut shards = Vec::new();

    // Ports are consumed in shard order, primary first, then its replicas.
    for shard_config in &config.shards {
        let name = if shard_config.name.is_empty() {
            names::next()
        } else {
            shard_config.name.clone()
        };

        let mut primary_builder = cluster_node_builder(ports.next().unwrap());
        for customizer in &config.customizers {
            customizer.customize_main_node(&mut primary_builder, config, &name);
        }
        let primary = Arc::new(primary_builder.build()?);
        primary.start().await?;
        started.push(primary.clone());
        info!(shard = %name, port = primary.port(), "Started cluster primary");

        let mut replica_builders: Vec<RedisServerBuilder> = (0..shard_config.replicas)
            .map(|_| cluster_node_builder(ports.next().unwrap()))
            .collect();
        for customizer in &config.customizers {
            customizer.customize_replicas(&mut replica_builders, config, &name);
        }

        let mut replicas = Vec::new();
        for builder in replica_builders {
            let replica = Arc::new(builder.build()?);
            replica.start().await?;
            started.push(replica.clone());
            replicas.push(replica);
        }

        shards.push(ReplicationGroup {
            name,
            primary,
            replicas,
        });
    }

    let timeout = config.initialization_timeout;
    match tokio::time::timeout(timeout, form_cluster(&shards)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(Error::ClusterConvergenceTimeout { timeout }),
    }

    info!(
        shards = shards.len(),
        ports = ?shards.iter().flat_map(|s| s.servers().map(|n| n.port())).collect::<Vec<_>>(),
        "Redis cluster converged"
    );
    Ok(ShardedClusterTopology { shards })
}

fn cluster_node_builder(port: u16) -> RedisServerBuilder {
    let mut builder = RedisServerBuilder::new(port);
    builder
        .bind(DEFAULT_BIND)
        .setting("cluster-enabled yes")
        .setting(format!("cluster-config-file nodes-{port}.conf"))
        .setting(format!("cluster-node-timeout {CLUSTER_NODE_TIMEOUT_MS}"))
        .setting("appendonly no");
    builder
}

/// Joins the started nodes into one cluster: gossip introduction, slot
/// assignment for the primaries, replica wiring, then a poll until every
/// node reports `cluster_state:ok`.
async fn form_cluster(shards: &[ReplicationGroup]) -> Result<()> {
    let mut primary_conns = Vec::new();
    for shard in shards {
        primary_conns.push(connect(&shard.primary).await?);
    }

    // Introduce every node to the first primary; gossip spreads the rest.
    let meet_host = shards[0].primary.bind().to_string();
    let meet_port = shards[0].primary.port();
    for shard in shards {
        for node in shard.servers() {
            if node.port() == meet_port {
                continue;
            }
            let mut conn = connect(node).await?;
            let _: () = redis::cmd("CLUSTER")
                .arg("MEET")
                .arg(&meet_host)
                .arg(meet_port)
                .query_async(&mut conn)
                .await?;
        }
    }

    // Split the slot space contiguously across the shard primaries.
    for ((start, end), conn) in slot_ranges(shards.len()).into_iter().zip(&mut primary_conns) {
        let mut cmd = redis::cmd("CLUSTER");
        cmd.arg("ADDSLOTS");
        for slot in start..=end {
            cmd.arg(slot);
        }
        let _: () = cmd.query_async(conn).await?;
    }

    // Wire each replica to its shard's primary. The replica can only obey
    // REPLICATE once gossip has told it about the primary's node id.
    for (shard, conn) in shards.iter().zip(&mut primary_conns) {
        let primary_id: String = redis::cmd("CLUSTER").arg("MYID").query_async(conn).await?;
        let primary_id = primary_id.trim().to_string();
        for replica in &shard.replicas {
            let mut replica_conn = connect(replica).await?;
            loop {
                let known: String = redis::cmd("CLUSTER")
                    .arg("NODES")
                    .query_async(&mut replica_conn)
                    .await?;
                if known.contains(&primary_id) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let _: () = redis::cmd("CLUSTER")
                .arg("REPLICATE")
                .arg(&primary_id)
                .query_async(&mut replica_conn)
                .await?;
            debug!(shard = %shard.name, replica = replica.port(), "Replica wired to primary");
        }
    }

    // Convergence: every node must see the cluster as healthy.
    loop {
        let mut all_ok = true;
        for shard in shards {
            for node in shard.servers() {
                let mut conn = connect(node).await?;
                let cluster_info: String = redis::cmd("CLUSTER")
                    .arg("INFO")
                    .query_async(&mut conn)
                    .await?;
                if !cluster_info.contains("cluster_state:ok") {
                    all_ok = false;
                    break;
                }
            }
            if !all_ok {
                break;
            }
        }
        if all_ok {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn connect(node: &RedisServer) -> Result<MultiplexedConnection> {
    let url = format!("redis://{}/", address::format(node.bind(), node.port()));
    let client = redis::Client::open(url)?;
    Ok(client.get_multiplexed_async_connection().await?)
}

/// Contiguous, disjoint slot ranges covering the full slot space.
pub(crate) fn slot_ranges(shard_count: usize) -> Vec<(u16, u16)> {
    let per_shard = SLOTS / shard_count as u16;
    let remainder = SLOTS % shard_count as u16;
    let mut ranges = Vec::with_capacity(shard_count);
    let mut start = 0u16;
    for i in 0..shard_count as u16 {
        let size = per_shard + u16::from(i < remainder);
        ranges.push((start, start + size - 1));
        start += size;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ShardedClusterConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_port_count_mismatch() {
        // Two shards with 1 and 2 replicas need exactly 5 ports.
        let config = ShardedClusterConfig {
            shards: vec![
                ShardConfig {
                    replicas: 1,
                    ..Default::default()
                },
                ShardConfig {
                    replicas: 2,
                    ..Default::default()
                },
            ],
            ports: vec![7000, 7001, 7002, 7003],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));

        let config = ShardedClusterConfig {
            ports: vec![7000, 7001, 7002, 7003, 7004],
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_ports() {
        let config = ShardedClusterConfig {
            shards: vec![ShardConfig {
                replicas: 1,
                ..Default::default()
            }],
            ports: vec![7000, 7000],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_more_shards_than_slots() {
        let config = ShardedClusterConfig {
            shards: vec![ShardConfig::default(); SLOTS as usize + 1],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));

        let config = ShardedClusterConfig {
            shards: vec![ShardConfig::default(); SLOTS as usize],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = ShardedClusterConfig {
            initialization_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_shard_without_replicas() {
        let config = ShardedClusterConfig {
            shards: vec![ShardConfig {
                replicas: 0,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn slot_ranges_cover_the_space_without_overlap() {
        for shard_count in 1..=5 {
            let ranges = slot_ranges(shard_count);
            assert_eq!(ranges.len(), shard_count);
            assert_eq!(ranges[0].0, 0);
            assert_eq!(ranges[shard_count - 1].1, SLOTS - 1);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].1 + 1, pair[1].0);
            }
        }
    }

    #[test]
    fn explicit_ports_are_consumed_in_shard_then_primary_then_replica_order() {
        let config = ShardedClusterConfig {
            shards: vec![
                ShardConfig {
                    name: "a".to_string(),
                    replicas: 1,
                },
                ShardConfig {
                    name: "b".to_string(),
                    replicas: 2,
                },
            ],
            ports: vec![7000, 7001, 7002, 7003, 7004],
            ..Default::default()
        };
        config.validate().unwrap();
        // Shard "a" gets 7000 (primary) and 7001; shard "b" gets the rest
        // with 7002 as primary.
        let mut ports = config.ports.iter();
        for shard in &config.shards {
            let primary = ports.next().unwrap();
            let replicas: Vec<_> = (0..shard.replicas).map(|_| ports.next().unwrap()).collect();
            match shard.name.as_str() {
                "a" => {
                    assert_eq!(*primary, 7000);
                    assert_eq!(replicas, [&7001]);
                }
                "b" => {
                    assert_eq!(*primary, 7002);
                    assert_eq!(replicas, [&7003, &7004]);
                }
                _ => unreachable!(),
            }
        }
    }
}
