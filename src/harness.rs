//! Test-harness adapter: provisions one topology per test context and tears
//! it down when the context ends.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::client::RedisTestClient;
use crate::conf::{self, RedisConf};
use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::registry::Registry;
use crate::server::RedisServer;
use crate::topology::{
    HighAvailabilityConfig, ShardedClusterConfig, StandaloneConfig, Topology, cluster,
    high_availability, standalone,
};

/// Shape of the topology to provision.
pub enum TopologyConfig {
    Standalone(StandaloneConfig),
    HighAvailability(HighAvailabilityConfig),
    ShardedCluster(ShardedClusterConfig),
}

/// A running topology together with its parsed config and bound client.
pub struct ProvisionedRedis {
    pub topology: Topology,
    pub conf: RedisConf,
    pub client: RedisTestClient,
}

/// Owns the port allocator and the per-context registry.
///
/// Create one harness at test-harness startup and drop it at shutdown; the
/// crate keeps no ambient global state.
pub struct RedisHarness {
    ports: Arc<PortAllocator>,
    registry: Registry<ProvisionedRedis>,
}

impl RedisHarness {
    pub fn new() -> Self {
        Self {
            ports: Arc::new(PortAllocator::new()),
            registry: Registry::new(),
        }
    }

    /// Builds the topology for `key`, or returns the one already registered.
    ///
    /// Concurrent calls for the same key build at most once. On any failure
    /// every process the build started is stopped before the error returns.
    pub async fn provision(
        &self,
        key: &str,
        config: TopologyConfig,
    ) -> Result<Arc<ProvisionedRedis>> {
        let ports = self.ports.clone();
        self.registry
            .compute_if_absent(key, || async move {
                let topology = match &config {
                    TopologyConfig::Standalone(c) => {
                        Topology::Standalone(standalone::build(c, &ports).await?)
                    }
                    TopologyConfig::HighAvailability(c) => {
                        Topology::HighAvailability(high_availability::build(c, &ports).await?)
                    }
                    TopologyConfig::ShardedCluster(c) => {
                        Topology::ShardedCluster(cluster::build(c, &ports).await?)
                    }
                };

                // Parse the first node's generated config; the client is
                // wired against what the server actually bound.
                let entry = match assemble(topology).await {
                    Ok(entry) => entry,
                    Err((topology, e)) => {
                        topology.stop().await;
                        return Err(e);
                    }
                };
                info!(key, ports = ?entry.topology.ports(), "Provisioned Redis topology");
                Ok(Arc::new(entry))
            })
            .await
    }

    /// Stops and removes the topology for `key`: client first, then
    /// sentinels, then nodes. Failures are logged, never propagated, and
    /// never block the remaining cleanup.
    pub async fn teardown(&self, key: &str) {
        let Some(entry) = self.registry.remove(key) else {
            debug!(key, "No Redis topology registered");
            return;
        };
        entry.client.close();
        entry.topology.stop().await;
        info!(key, "Redis topology torn down");
    }

    /// The provisioned entry for `key`; `None` for unknown keys.
    pub fn get(&self, key: &str) -> Option<Arc<ProvisionedRedis>> {
        self.registry.get(key)
    }

    /// The first data node of the topology for `key`.
    pub fn server(&self, key: &str) -> Option<Arc<RedisServer>> {
        self.get(key)
            .and_then(|entry| entry.topology.servers().first().cloned())
    }

    /// The parsed config of the topology's first node for `key`.
    pub fn conf(&self, key: &str) -> Option<RedisConf> {
        self.get(key).map(|entry| entry.conf.clone())
    }

    /// Deletes all keys of the topology for `key`; used between tests.
    pub async fn flush_all(&self, key: &str) -> Result<()> {
        let entry = self.get(key).ok_or_else(|| {
            Error::Validation(format!("No Redis topology registered for context '{key}'"))
        })?;
        entry.client.flush_all().await
    }

    /// Like [`flush_all`](Self::flush_all), but failures are only logged.
    pub async fn flush_all_safely(&self, key: &str) {
        if let Err(e) = self.flush_all(key).await {
            error!(key, error = %e, "Failed to flush Redis");
        }
    }
}

impl Default for RedisHarness {
    fn default() -> Self {
        Self::new()
    }
}

async fn assemble(topology: Topology) -> std::result::Result<ProvisionedRedis, (Topology, Error)> {
    let Some(first) = topology.servers().first().cloned() else {
        return Err((
            topology,
            Error::Validation("topology has no nodes".to_string()),
        ));
    };
    let conf = match RedisConf::parse_file(conf::locate(&first)).await {
        Ok(conf) => conf,
        Err(e) => return Err((topology, e)),
    };
    let client = match RedisTestClient::for_topology(&topology, &conf) {
        Ok(client) => client,
        Err(e) => return Err((topology, e)),
    };
    Ok(ProvisionedRedis {
        topology,
        conf,
        client,
    })
}
