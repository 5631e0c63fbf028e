//! Free-port issuance for Redis nodes and sentinels.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};

/// Default port of a Redis server.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Default port of Redis Sentinel.
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// Offset between a node's data port and its cluster bus port.
pub const BUS_PORT_OFFSET: u16 = 10_000;

/// Highest candidate data port. Keeps the paired bus port a valid TCP port.
pub const MAX_CANDIDATE_PORT: u16 = u16::MAX - BUS_PORT_OFFSET;

/// Hands out unused TCP ports for Redis instances.
///
/// Every issued data port also reserves its cluster bus port
/// (`port + 10000`), so nodes of a later cluster topology never collide on
/// gossip ports. A single allocator is shared by all topologies built in the
/// same process. A candidate pair is reserved in the set before it is
/// probed, so concurrent builds cannot race between the availability check
/// and the insert, while the bind probes themselves run outside the lock.
pub struct PortAllocator {
    handed_out: Mutex<BTreeSet<u16>>,
    probe: fn(u16) -> bool,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_probe(probe_loopback)
    }

    /// Uses a custom availability probe instead of binding loopback sockets.
    fn with_probe(probe: fn(u16) -> bool) -> Self {
        Self {
            handed_out: Mutex::new(BTreeSet::new()),
            probe,
        }
    }

    /// Provides the next free port, reserving its bus port alongside.
    ///
    /// With `sentinel` set, candidates start at the default sentinel port
    /// instead of the default Redis port.
    pub fn next_port(&self, sentinel: bool) -> Result<u16> {
        let min_port = if sentinel {
            DEFAULT_SENTINEL_PORT
        } else {
            DEFAULT_REDIS_PORT
        };
        for candidate in min_port..=MAX_CANDIDATE_PORT {
            let bus_port = candidate + BUS_PORT_OFFSET;
            {
                let mut handed_out = self.handed_out.lock().unwrap();
                if handed_out.contains(&candidate) || handed_out.contains(&bus_port) {
                    continue;
                }
                handed_out.insert(candidate);
                handed_out.insert(bus_port);
            }
            // Probing binds sockets, so it happens outside the lock; the
            // pair is already reserved, concurrent callers move on to other
            // candidates meanwhile.
            if (self.probe)(candidate) && (self.probe)(bus_port) {
                debug!(port = candidate, sentinel, "Handed out port");
                return Ok(candidate);
            }
            let mut handed_out = self.handed_out.lock().unwrap();
            handed_out.remove(&candidate);
            handed_out.remove(&bus_port);
        }
        Err(Error::PortExhaustion)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks availability by binding and immediately closing a loopback listener.
fn probe_loopback(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
