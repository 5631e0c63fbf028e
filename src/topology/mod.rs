//! Topology assembly: standalone, high availability and sharded cluster.

pub mod cluster;
pub mod high_availability;
pub mod standalone;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::ports::PortAllocator;
use crate::server::{DEFAULT_BIND, RedisServer};

pub use cluster::{ShardConfig, ShardCustomizer, ShardedClusterConfig, ShardedClusterTopology};
pub use high_availability::{
    HighAvailabilityConfig, HighAvailabilityCustomizer, HighAvailabilityTopology,
    ReplicationGroupConfig, SentinelConfig,
};
pub use standalone::{StandaloneConfig, StandaloneCustomizer, StandaloneTopology};

/// A launched replication group or shard: one primary plus its replicas.
pub struct ReplicationGroup {
    pub name: String,
    pub primary: Arc<RedisServer>,
    pub replicas: Vec<Arc<RedisServer>>,
}

impl ReplicationGroup {
    /// Primary first, replicas in launch order.
    pub fn servers(&self) -> impl Iterator<Item = &Arc<RedisServer>> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }
}

/// A launched sentinel and the groups it monitors.
pub struct SentinelHandle {
    pub server: Arc<RedisServer>,
    pub monitored_groups: Vec<String>,
}

/// A fully assembled, immutable topology of running processes.
pub enum Topology {
    Standalone(StandaloneTopology),
    HighAvailability(HighAvailabilityTopology),
    ShardedCluster(ShardedClusterTopology),
}

impl Topology {
    /// All data nodes, primaries before their replicas, in group order.
    pub fn servers(&self) -> Vec<Arc<RedisServer>> {
        match self {
            Topology::Standalone(t) => vec![t.node.clone()],
            Topology::HighAvailability(t) => t
                .groups
                .iter()
                .flat_map(|g| g.servers())
                .cloned()
                .collect(),
            Topology::ShardedCluster(t) => t
                .shards
                .iter()
                .flat_map(|g| g.servers())
                .cloned()
                .collect(),
        }
    }

    /// Sentinels, if this is a high availability topology.
    pub fn sentinels(&self) -> &[SentinelHandle] {
        match self {
            Topology::HighAvailability(t) => &t.sentinels,
            _ => &[],
        }
    }

    /// Data ports of all nodes, in launch order.
    pub fn ports(&self) -> Vec<u16> {
        self.servers().iter().map(|s| s.port()).collect()
    }

    /// Stops every sentinel, then every node. Per-process failures are
    /// logged and never abort the remaining shutdown sequence.
    pub async fn stop(&self) {
        info!(ports = ?self.ports(), "Stopping Redis topology");
        for sentinel in self.sentinels() {
            sentinel.server.stop_safely().await;
        }
        for server in self.servers() {
            server.stop_safely().await;
        }
    }
}

/// Stops everything a failed build managed to start, in reverse launch
/// order, before the error propagates.
pub(crate) async fn rollback(started: &[Arc<RedisServer>]) {
    for server in started.iter().rev() {
        server.stop_safely().await;
    }
}

/// Resolves the ports for `node_count` nodes: a fully fresh allocation when
/// no explicit list is given, otherwise the explicit list with `0` entries
/// replaced by fresh allocations. Allocations colliding with a manually
/// specified port are discarded and retried.
pub(crate) fn resolve_ports(
    explicit: &[u16],
    node_count: usize,
    allocator: &PortAllocator,
    manually_specified: &BTreeSet<u16>,
    sentinel: bool,
) -> Result<Vec<u16>> {
    if explicit.is_empty() {
        (0..node_count)
            .map(|_| next_unspecified(allocator, sentinel, manually_specified))
            .collect()
    } else {
        explicit
            .iter()
            .map(|&port| {
                if port == 0 {
                    next_unspecified(allocator, sentinel, manually_specified)
                } else {
                    Ok(port)
                }
            })
            .collect()
    }
}

/// Resolves the bind addresses for `node_count` nodes, defaulting empty
/// entries (or the whole list) to [`DEFAULT_BIND`].
pub(crate) fn resolve_binds(explicit: &[String], node_count: usize) -> Vec<String> {
    if explicit.is_empty() {
        vec![DEFAULT_BIND.to_string(); node_count]
    } else {
        explicit
            .iter()
            .map(|bind| {
                if bind.is_empty() {
                    DEFAULT_BIND.to_string()
                } else {
                    bind.clone()
                }
            })
            .collect()
    }
}

pub(crate) fn next_unspecified(
    allocator: &PortAllocator,
    sentinel: bool,
    manually_specified: &BTreeSet<u16>,
) -> Result<u16> {
    loop {
        let port = allocator.next_port(sentinel)?;
        if !manually_specified.contains(&port) {
            return Ok(port);
        }
    }
}
