//! redbed - disposable Redis topologies for integration tests.
//!
//! Spawns real `redis-server` processes as standalone nodes, sentinel-backed
//! high availability groups or sharded clusters, wires a `redis` client to
//! them and tears everything down when the owning test context ends.
//!
//! ```no_run
//! use redbed::harness::{RedisHarness, TopologyConfig};
//! use redbed::topology::StandaloneConfig;
//!
//! # async fn example() -> redbed::Result<()> {
//! let harness = RedisHarness::new();
//! let redis = harness
//!     .provision("my-test", TopologyConfig::Standalone(StandaloneConfig::default()))
//!     .await?;
//! redis.client.ping().await?;
//! harness.teardown("my-test").await;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod client;
pub mod conf;
pub mod error;
pub mod harness;
mod names;
pub mod ports;
pub mod registry;
pub mod server;
pub mod topology;

pub use error::{ConfError, Error, Result};
pub use harness::{ProvisionedRedis, RedisHarness, TopologyConfig};
