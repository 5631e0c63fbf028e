//! Redis client construction bound to an assembled topology.
//!
//! The wire protocol itself comes from the `redis` crate; this module only
//! wires the right client flavour to the topology's addresses and exposes
//! the handful of operations the harness needs.

use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::sentinel::{SentinelClient, SentinelServerType};
use tokio::sync::Mutex;
use tracing::debug;

use crate::address;
use crate::conf::RedisConf;
use crate::error::{Error, Result};
use crate::topology::Topology;

/// A protocol client bound to a topology's addresses.
pub enum RedisTestClient {
    Standalone {
        client: redis::Client,
    },
    HighAvailability {
        // SentinelClient wants exclusive access for connection lookups.
        client: Mutex<SentinelClient>,
        master_name: String,
    },
    Cluster {
        client: ClusterClient,
        node_urls: Vec<String>,
    },
}

impl RedisTestClient {
    /// Builds the client flavour matching the topology. The standalone
    /// flavour prefers the bind address the server actually wrote to its
    /// config file over the requested one.
    pub fn for_topology(topology: &Topology, conf: &RedisConf) -> Result<Self> {
        match topology {
            Topology::Standalone(t) => {
                let host = conf
                    .binds()
                    .first()
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| t.node.bind().to_string());
                let url = format!("redis://{}/", address::format(&host, t.node.port()));
                Ok(RedisTestClient::Standalone {
                    client: redis::Client::open(url)?,
                })
            }
            Topology::HighAvailability(t) => {
                let sentinel_urls: Vec<String> = t
                    .sentinels
                    .iter()
                    .map(|s| {
                        format!(
                            "redis://{}/",
                            address::format(s.server.bind(), s.server.port())
                        )
                    })
                    .collect();
                let master_name = t
                    .groups
                    .first()
                    .map(|g| g.name.clone())
                    .ok_or_else(|| Error::Validation("topology has no groups".to_string()))?;
                let client = SentinelClient::build(
                    sentinel_urls,
                    master_name.clone(),
                    None,
                    SentinelServerType::Master,
                )?;
                Ok(RedisTestClient::HighAvailability {
                    client: Mutex::new(client),
                    master_name,
                })
            }
            Topology::ShardedCluster(t) => {
                let node_urls: Vec<String> = t
                    .shards
                    .iter()
                    .flat_map(|shard| shard.servers())
                    .map(|node| format!("redis://{}/", address::format(node.bind(), node.port())))
                    .collect();
                let client = ClusterClient::new(node_urls.clone())?;
                Ok(RedisTestClient::Cluster { client, node_urls })
            }
        }
    }

    /// The monitored group this client follows, for HA clients.
    pub fn master_name(&self) -> Option<&str> {
        match self {
            RedisTestClient::HighAvailability { master_name, .. } => Some(master_name),
            _ => None,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self {
            RedisTestClient::Standalone { client } => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            }
            RedisTestClient::HighAvailability { client, .. } => {
                let mut conn = client.lock().await.get_async_connection().await?;
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            }
            RedisTestClient::Cluster { client, .. } => {
                let mut conn = client.get_async_connection().await?;
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            }
        }
        Ok(())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        match self {
            RedisTestClient::Standalone { client } => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async(&mut conn)
                    .await?;
            }
            RedisTestClient::HighAvailability { client, .. } => {
                let mut conn = client.lock().await.get_async_connection().await?;
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async(&mut conn)
                    .await?;
            }
            RedisTestClient::Cluster { client, .. } => {
                let mut conn = client.get_async_connection().await?;
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = match self {
            RedisTestClient::Standalone { client } => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                redis::cmd("GET").arg(key).query_async(&mut conn).await?
            }
            RedisTestClient::HighAvailability { client, .. } => {
                let mut conn = client.lock().await.get_async_connection().await?;
                redis::cmd("GET").arg(key).query_async(&mut conn).await?
            }
            RedisTestClient::Cluster { client, .. } => {
                let mut conn = client.get_async_connection().await?;
                redis::cmd("GET").arg(key).query_async(&mut conn).await?
            }
        };
        Ok(value)
    }

    /// Deletes all keys of all databases. For the cluster flavour this fans
    /// out to every node directly, since FLUSHALL is not routable.
    pub async fn flush_all(&self) -> Result<()> {
        match self {
            RedisTestClient::Standalone { client } => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                flushall(&mut conn).await?;
            }
            RedisTestClient::HighAvailability { client, .. } => {
                let mut conn = client.lock().await.get_async_connection().await?;
                flushall(&mut conn).await?;
            }
            RedisTestClient::Cluster { node_urls, .. } => {
                for url in node_urls {
                    let client = redis::Client::open(url.as_str())?;
                    let mut conn = client.get_multiplexed_async_connection().await?;
                    // Replicas reject writes; only primaries flush.
                    let role: Vec<redis::Value> =
                        redis::cmd("ROLE").query_async(&mut conn).await?;
                    let is_master = matches!(
                        role.first(),
                        Some(redis::Value::BulkString(kind)) if kind == b"master"
                    );
                    if is_master {
                        flushall(&mut conn).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Releases the client. The `redis` crate's clients open connections
    /// per call, so this only exists to keep the client-before-servers
    /// shutdown ordering explicit.
    pub fn close(&self) {
        debug!("Closing Redis client");
    }
}

async fn flushall(conn: &mut MultiplexedConnection) -> Result<()> {
    let _: () = redis::cmd("FLUSHALL").query_async(conn).await?;
    Ok(())
}
