//! Primary/replica groups with automatic-failover sentinels.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::names;
use crate::ports::PortAllocator;
use crate::server::{DEFAULT_BIND, RedisSentinelBuilder, RedisServer, RedisServerBuilder};
use crate::topology::{
    ReplicationGroup, SentinelHandle, next_unspecified, resolve_binds, resolve_ports, rollback,
};

/// Quorum for a group with a single primary.
const QUORUM: usize = 1 / 2 + 1;

/// Configuration of one replication group.
#[derive(Clone)]
pub struct ReplicationGroupConfig {
    /// Group name; empty means a name is drawn from the name pool. The name
    /// is sanitized to alphanumerics before use as a monitor identifier.
    pub name: String,
    /// Number of replicas; must be at least 1.
    pub replicas: usize,
    /// Ports for the nodes, primary first. Empty for a fresh allocation;
    /// `0` entries are replaced by fresh allocations. If non-empty, the
    /// length must be `replicas + 1`.
    pub ports: Vec<u16>,
    /// Bind addresses for the nodes, primary first. Same length rule as
    /// `ports`; empty entries default to the default bind.
    pub binds: Vec<String>,
}

impl Default for ReplicationGroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            replicas: 2,
            ports: Vec::new(),
            binds: Vec::new(),
        }
    }
}

/// Configuration of one sentinel process.
#[derive(Clone)]
pub struct SentinelConfig {
    /// Names of the groups to monitor; empty means all groups.
    pub monitored_groups: Vec<String>,
    /// Port; `0` means "allocate upwards from 26379".
    pub port: u16,
    /// Bind address; empty means the default bind.
    pub bind: String,
    pub down_after_millis: u64,
    pub failover_timeout_millis: u64,
    pub parallel_syncs: u32,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            monitored_groups: Vec::new(),
            port: 0,
            bind: String::new(),
            down_after_millis: 60_000,
            failover_timeout_millis: 180_000,
            parallel_syncs: 1,
        }
    }
}

/// Customizes the builders of a high availability topology. All methods
/// default to no-ops; implement the ones you need.
pub trait HighAvailabilityCustomizer: Send + Sync {
    /// Runs against the primary's builder of each group before launch.
    fn customize_main_node(
        &self,
        _builder: &mut RedisServerBuilder,
        _config: &HighAvailabilityConfig,
        _group: &str,
    ) {
    }

    /// Runs once per group against the full ordered list of replica
    /// builders, so group-wide policy can be applied in one place.
    fn customize_replicas(
        &self,
        _builders: &mut [RedisServerBuilder],
        _config: &HighAvailabilityConfig,
        _group: &str,
    ) {
    }

    /// Runs against each sentinel's builder before launch.
    fn customize_sentinel(
        &self,
        _builder: &mut RedisSentinelBuilder,
        _config: &HighAvailabilityConfig,
        _sentinel: &SentinelConfig,
    ) {
    }
}

/// Configuration of a high availability topology.
#[derive(Clone)]
pub struct HighAvailabilityConfig {
    pub groups: Vec<ReplicationGroupConfig>,
    pub sentinels: Vec<SentinelConfig>,
    /// Customizers, invoked in array order.
    pub customizers: Vec<Arc<dyn HighAvailabilityCustomizer>>,
}

impl Default for HighAvailabilityConfig {
    fn default() -> Self {
        Self {
            groups: vec![ReplicationGroupConfig::default()],
            sentinels: vec![SentinelConfig::default()],
            customizers: Vec::new(),
        }
    }
}

impl HighAvailabilityConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::Validation(
                "Replication groups must not be empty".to_string(),
            ));
        }
        for group in &self.groups {
            if group.replicas == 0 {
                return Err(Error::Validation(
                    "Replicas must be greater than 0".to_string(),
                ));
            }
            let node_count = group.replicas + 1;
            if !group.ports.is_empty() && group.ports.len() != node_count {
                return Err(Error::Validation(
                    "If ports are specified, they must match the number of nodes".to_string(),
                ));
            }
            if !group.binds.is_empty() && group.binds.len() != node_count {
                return Err(Error::Validation(
                    "If bind addresses are specified, they must match the number of nodes"
                        .to_string(),
                ));
            }
        }

        let declared: Vec<String> = self
            .groups
            .iter()
            .filter(|g| !g.name.is_empty())
            .map(|g| names::sanitize(&g.name))
            .collect();
        // A name that sanitizes away entirely would leave an empty monitor
        // token in the sentinel config.
        if declared.iter().any(|name| name.is_empty()) {
            return Err(Error::Validation(
                "Replication group names must contain at least one alphanumeric character"
                    .to_string(),
            ));
        }
        let unique: HashSet<&String> = declared.iter().collect();
        if unique.len() != declared.len() {
            return Err(Error::Validation(
                "Replication group names must be unique".to_string(),
            ));
        }

        if self.sentinels.is_empty() {
            return Err(Error::Validation("Sentinels must not be empty".to_string()));
        }
        for sentinel in &self.sentinels {
            if sentinel.down_after_millis == 0 {
                return Err(Error::Validation(
                    "Timeout for unreachable nodes must be greater than 0".to_string(),
                ));
            }
            if sentinel.failover_timeout_millis == 0 {
                return Err(Error::Validation(
                    "Failover timeout must be greater than 0".to_string(),
                ));
            }
            if sentinel.parallel_syncs == 0 {
                return Err(Error::Validation(
                    "Parallel syncs must be greater than 0".to_string(),
                ));
            }
            for monitored in &sentinel.monitored_groups {
                if !self.groups.iter().any(|g| &g.name == monitored) {
                    return Err(Error::Validation(format!(
                        "Sentinel monitors unknown replication group '{monitored}'"
                    )));
                }
            }
        }

        let explicit = self.manually_specified_ports();
        let explicit_count = self
            .groups
            .iter()
            .flat_map(|g| &g.ports)
            .filter(|&&p| p != 0)
            .count()
            + self.sentinels.iter().filter(|s| s.port != 0).count();
        if explicit.len() != explicit_count {
            return Err(Error::Validation(
                "Ports must not be specified more than once".to_string(),
            ));
        }
        Ok(())
    }

    /// All explicitly requested, non-zero ports across groups and sentinels.
    fn manually_specified_ports(&self) -> BTreeSet<u16> {
        self.groups
            .iter()
            .flat_map(|g| g.ports.iter().copied())
            .chain(self.sentinels.iter().map(|s| s.port))
            .filter(|&p| p != 0)
            .collect()
    }
}

pub struct HighAvailabilityTopology {
    pub groups: Vec<ReplicationGroup>,
    pub sentinels: Vec<SentinelHandle>,
}

pub async fn build(
    config: &HighAvailabilityConfig,
    ports: &PortAllocator,
) -> Result<HighAvailabilityTopology> {
    config.validate()?;
    let manually_specified = config.manually_specified_ports();
    let mut started = Vec::new();
    match build_inner(config, ports, &manually_specified, &mut started).await {
        Ok(topology) => Ok(topology),
        Err(e) => {
            rollback(&started).await;
            Err(e)
        }
    }
}

async fn build_inner(
    config: &HighAvailabilityConfig,
    ports: &PortAllocator,
    manually_specified: &BTreeSet<u16>,
    started: &mut Vec<Arc<RedisServer>>,
) -> Result<HighAvailabilityTopology> {
    // (declared name, running group); the declared name is what sentinel
    // configs reference, the group carries the final sanitized name.
    let mut groups: Vec<(String, ReplicationGroup)> = Vec::new();

    for group_config in &config.groups {
        let name = group_name(group_config);
        let node_count = group_config.replicas + 1;
        let node_ports = resolve_ports(
            &group_config.ports,
            node_count,
            ports,
            manually_specified,
            false,
        )?;
        let node_binds = resolve_binds(&group_config.binds, node_count);

        let primary_port = node_ports[0];
        let primary_bind = node_binds[0].clone();
        let mut builder = RedisServerBuilder::new(primary_port);
        builder.bind(&primary_bind);
        for customizer in &config.customizers {
            customizer.customize_main_node(&mut builder, config, &name);
        }
        let primary = Arc::new(builder.build()?);
        primary.start().await?;
        started.push(primary.clone());
        info!(group = %name, port = primary_port, "Started Redis primary");

        let mut replica_builders = Vec::new();
        for (port, bind) in node_ports[1..].iter().zip(&node_binds[1..]) {
            let mut builder = RedisServerBuilder::new(*port);
            builder.bind(bind).replica_of(&primary_bind, primary_port);
            replica_builders.push(builder);
        }
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
        info!(group = %name, replicas = replicas.len(), "Replication group running");

        groups.push((
            group_config.name.clone(),
            ReplicationGroup {
                name,
                primary,
                replicas,
            },
        ));
    }

    // Sentinels start only once the full primary/replica set is reachable,
    // since they discover the replication topology from the primaries.
    let mut sentinels = Vec::new();
    for sentinel_config in &config.sentinels {
        let sentinel =
            start_sentinel(sentinel_config, config, &groups, ports, manually_specified).await?;
        started.push(sentinel.server.clone());
        sentinels.push(sentinel);
    }

    Ok(HighAvailabilityTopology {
        groups: groups.into_iter().map(|(_, group)| group).collect(),
        sentinels,
    })
}

async fn start_sentinel(
    sentinel_config: &SentinelConfig,
    config: &HighAvailabilityConfig,
    groups: &[(String, ReplicationGroup)],
    ports: &PortAllocator,
    manually_specified: &BTreeSet<u16>,
) -> Result<SentinelHandle> {
    let port = if sentinel_config.port != 0 {
        sentinel_config.port
    } else {
        next_unspecified(ports, true, manually_specified)?
    };
    let bind = if sentinel_config.bind.is_empty() {
        DEFAULT_BIND
    } else {
        &sentinel_config.bind
    };

    let monitored: Vec<&ReplicationGroup> = if sentinel_config.monitored_groups.is_empty() {
        groups.iter().map(|(_, group)| group).collect()
    } else {
        groups
            .iter()
            .filter(|(declared, _)| sentinel_config.monitored_groups.contains(declared))
            .map(|(_, group)| group)
            .collect()
    };

    let mut builder = RedisSentinelBuilder::new(port);
    builder.bind(bind);
    for group in &monitored {
        for line in monitor_settings(
            &group.name,
            group.primary.bind(),
            group.primary.port(),
            sentinel_config,
        ) {
            builder.setting(line);
        }
    }
    for customizer in &config.customizers {
        customizer.customize_sentinel(&mut builder, config, sentinel_config);
    }

    let server = Arc::new(builder.build()?);
    server.start().await?;
    info!(port, monitored = ?monitored.iter().map(|g| &g.name).collect::<Vec<_>>(), "Started Redis sentinel");

    Ok(SentinelHandle {
        server,
        monitored_groups: monitored.iter().map(|g| g.name.clone()).collect(),
    })
}

/// The four monitor directives a sentinel needs for one group.
pub(crate) fn monitor_settings(
    group: &str,
    primary_bind: &str,
    primary_port: u16,
    sentinel: &SentinelConfig,
) -> [String; 4] {
    [
        format!("sentinel monitor {group} {primary_bind} {primary_port} {QUORUM}"),
        format!(
            "sentinel down-after-milliseconds {group} {}",
            sentinel.down_after_millis
        ),
        format!(
            "sentinel failover-timeout {group} {}",
            sentinel.failover_timeout_millis
        ),
        format!(
            "sentinel parallel-syncs {group} {}",
            sentinel.parallel_syncs
        ),
    ]
}

fn group_name(group: &ReplicationGroupConfig) -> String {
    let name = if group.name.is_empty() {
        names::next()
    } else {
        group.name.clone()
    };
    names::sanitize(&name)
}
