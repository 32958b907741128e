//! Weighted assignment of a fixed set of virtual nodes onto real servers.
//!
//! Keys hash onto one of `virtual_node_count` virtual nodes (CRC32 of the key modulo the count),
//! and every virtual node is owned by exactly one real server. Ownership is proportional to server
//! weight. Because the virtual node space never changes size, membership or weight changes are
//! absorbed by moving individual virtual nodes between servers: [`ServerMap::remap`] keeps every
//! assignment it can and only moves the nodes released by removed or shrunk servers, so roughly
//! `changed_weight / total_weight` of the keyspace moves instead of nearly all of it.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Error;

/// Number of virtual nodes used when the configuration does not name a positive count.
pub const DEFAULT_VIRTUAL_NODE_COUNT: u32 = 256;

/// Smallest weight a real server can carry; lower configured weights are raised to it.
pub const MIN_WEIGHT: u32 = 10;

/// A backend server identified by `host:port`, carrying a relative weight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealServer {
    /// Lower-cased host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Relative capacity, at least [`MIN_WEIGHT`].
    pub weight: u32,
}

impl RealServer {
    /// Creates a server entry, raising `weight` to [`MIN_WEIGHT`] if needed.
    pub fn new<S: Into<String>>(host: S, port: u16, weight: u32) -> RealServer {
        RealServer {
            host: host.into(),
            port,
            weight: weight.max(MIN_WEIGHT),
        }
    }

    /// The identity of the server, `<host>:<port>`.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Assignment of every virtual node to one real server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMap {
    virtual_node_count: u32,
    real_servers: Vec<RealServer>,
    // Indexed by virtual node, holds an index into `real_servers`.
    virtual_to_real: Vec<u32>,
}

impl ServerMap {
    /// Builds a fresh map for `servers` over `virtual_node_count` virtual nodes.
    ///
    /// Virtual node `i` goes to the server owning slot `i mod W` of the weight pool, where the pool
    /// lists server `k` `weight_k` times in list order and `W` is the total weight. A server that
    /// already holds its share (`floor(weight * count / total_weight)`, the last server taking the
    /// remainder) passes the node on; such deferred nodes are
    /// handed out afterwards, in index order, to the servers still below their share. The result
    /// is deterministic for a given server list and node count.
    ///
    /// Fails with [`Error::Configuration`] for an empty list, a weight below [`MIN_WEIGHT`] or a
    /// `host:port` listed twice.
    pub fn build(servers: Vec<RealServer>, virtual_node_count: u32) -> Result<ServerMap, Error> {
        validate_servers(&servers)?;
        let virtual_node_count = normalize_virtual_node_count(virtual_node_count);

        let pool_ends: Vec<u64> = servers
            .iter()
            .scan(0u64, |end, server| {
                *end += u64::from(server.weight);
                Some(*end)
            })
            .collect();
        let total_weight = pool_ends[pool_ends.len() - 1];
        let targets = target_counts(&servers, virtual_node_count);

        let mut owned = vec![0u32; servers.len()];
        let mut virtual_to_real = vec![0u32; virtual_node_count as usize];
        let mut deferred = Vec::new();
        for (node, owner) in virtual_to_real.iter_mut().enumerate() {
            let slot = node as u64 % total_weight;
            let k = pool_ends.partition_point(|&end| end <= slot);
            if owned[k] < targets[k] {
                *owner = k as u32;
                owned[k] += 1;
            } else {
                deferred.push(node);
            }
        }

        let mut k = 0;
        for node in deferred {
            while owned[k] >= targets[k] {
                k += 1;
            }
            virtual_to_real[node] = k as u32;
            owned[k] += 1;
        }

        debug!(
            servers = servers.len(),
            virtual_node_count, "built server map"
        );

        Ok(ServerMap {
            virtual_node_count,
            real_servers: servers,
            virtual_to_real,
        })
    }

    /// Recomputes the map for a new server list while moving as few virtual nodes as possible.
    ///
    /// Servers present in both lists keep their virtual nodes up to their new share; nodes of
    /// removed servers and the surplus of shrunk servers form a remap pool, which first tops up
    /// grown servers and then fills newly added servers. Returns `Ok(None)` when nothing has to
    /// move, in which case the current map stays authoritative. The new list is validated like
    /// in [`build`](Self::build).
    pub fn remap(&self, servers: Vec<RealServer>) -> Result<Option<ServerMap>, Error> {
        validate_servers(&servers)?;

        let new_index: HashMap<String, usize> = servers
            .iter()
            .enumerate()
            .map(|(k, server)| (server.host_port(), k))
            .collect();
        let targets = target_counts(&servers, self.virtual_node_count);

        let mut old_owned = vec![Vec::new(); self.real_servers.len()];
        for (node, &owner) in self.virtual_to_real.iter().enumerate() {
            old_owned[owner as usize].push(node as u32);
        }

        let mut kept: Vec<Option<Vec<u32>>> = vec![None; servers.len()];
        let mut pool = Vec::new();
        for (server, mut nodes) in self.real_servers.iter().zip(old_owned) {
            match new_index.get(&server.host_port()) {
                Some(&k) => {
                    let target = targets[k] as usize;
                    if nodes.len() > target {
                        pool.extend(nodes.drain(target..));
                    }
                    kept[k] = Some(nodes);
                }
                None => pool.append(&mut nodes),
            }
        }

        if pool.is_empty() {
            debug!("server list change moves no virtual nodes");
            return Ok(None);
        }
        let released = pool.len();
        let mut pool = pool.into_iter();

        // Servers that survived get topped up first, then the newcomers.
        let mut assigned: Vec<Vec<u32>> = vec![Vec::new(); servers.len()];
        for (k, nodes) in kept.iter_mut().enumerate() {
            if let Some(nodes) = nodes.take() {
                let deficit = (targets[k] as usize).saturating_sub(nodes.len());
                assigned[k] = nodes;
                assigned[k].extend(pool.by_ref().take(deficit));
            }
        }
        for (k, nodes) in assigned.iter_mut().enumerate() {
            if !self.contains(&servers[k]) {
                nodes.extend(pool.by_ref().take(targets[k] as usize));
            }
        }
        debug_assert!(pool.next().is_none(), "remap pool not fully consumed");

        let mut virtual_to_real = vec![0u32; self.virtual_node_count as usize];
        for (k, nodes) in assigned.iter().enumerate() {
            for &node in nodes {
                virtual_to_real[node as usize] = k as u32;
            }
        }

        info!(
            released,
            servers = servers.len(),
            virtual_node_count = self.virtual_node_count,
            "remapped virtual nodes"
        );

        Ok(Some(ServerMap {
            virtual_node_count: self.virtual_node_count,
            real_servers: servers,
            virtual_to_real,
        }))
    }

    /// Number of virtual nodes in the map.
    pub fn virtual_node_count(&self) -> u32 {
        self.virtual_node_count
    }

    /// The real servers, in configuration order.
    pub fn real_servers(&self) -> &[RealServer] {
        &self.real_servers
    }

    /// Owner index (into [`real_servers`](Self::real_servers)) of every virtual node.
    pub fn virtual_to_real(&self) -> &[u32] {
        &self.virtual_to_real
    }

    /// The virtual node a key hashes onto.
    pub fn virtual_node_for<K: AsRef<[u8]>>(&self, key: K) -> u32 {
        crc32fast::hash(key.as_ref()) % self.virtual_node_count
    }

    /// Index of the real server owning the virtual node `key` hashes onto.
    pub fn server_index_for<K: AsRef<[u8]>>(&self, key: K) -> usize {
        self.virtual_to_real[self.virtual_node_for(key) as usize] as usize
    }

    /// Number of virtual nodes owned by each real server, in list order.
    pub fn owned_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.real_servers.len()];
        for &owner in &self.virtual_to_real {
            counts[owner as usize] += 1;
        }
        counts
    }

    /// Number of virtual nodes whose owning `host:port` differs between the two maps.
    ///
    /// Maps of different sizes are compared over the common prefix of virtual nodes.
    pub fn moved_nodes(&self, other: &ServerMap) -> usize {
        self.virtual_to_real
            .iter()
            .zip(&other.virtual_to_real)
            .filter(|&(&a, &b)| {
                let a = &self.real_servers[a as usize];
                let b = &other.real_servers[b as usize];
                (&a.host, a.port) != (&b.host, b.port)
            })
            .count()
    }

    /// Checks the structural invariants of a map that came from outside this process.
    pub(crate) fn is_consistent(&self) -> bool {
        self.virtual_node_count > 0
            && !self.real_servers.is_empty()
            && self.virtual_to_real.len() == self.virtual_node_count as usize
            && self
                .virtual_to_real
                .iter()
                .all(|&owner| (owner as usize) < self.real_servers.len())
            && validate_servers(&self.real_servers).is_ok()
    }

    fn contains(&self, server: &RealServer) -> bool {
        self.real_servers
            .iter()
            .any(|s| s.host == server.host && s.port == server.port)
    }
}

/// Rejects server lists no map can be built from.
fn validate_servers(servers: &[RealServer]) -> Result<(), Error> {
    if servers.is_empty() {
        return Err(Error::configuration("no real servers configured"));
    }

    let mut seen = HashSet::with_capacity(servers.len());
    for server in servers {
        if server.weight < MIN_WEIGHT {
            return Err(Error::configuration(format!(
                "server {} has weight {}, below the minimum of {}",
                server.host_port(),
                server.weight,
                MIN_WEIGHT
            )));
        }
        if !seen.insert((server.host.as_str(), server.port)) {
            return Err(Error::configuration(format!(
                "server {} is listed more than once",
                server.host_port()
            )));
        }
    }
    Ok(())
}

/// Virtual node counts of zero fall back to [`DEFAULT_VIRTUAL_NODE_COUNT`].
pub(crate) fn normalize_virtual_node_count(count: u32) -> u32 {
    if count == 0 {
        DEFAULT_VIRTUAL_NODE_COUNT
    } else {
        count
    }
}

/// Share of virtual nodes each server should own.
///
/// Every server but the last gets `floor(weight * count / total_weight)`; the last one takes the
/// remainder so the shares always add up to `count`. The list must have passed
/// `validate_servers`.
pub(crate) fn target_counts(servers: &[RealServer], virtual_node_count: u32) -> Vec<u32> {
    let total_weight: u64 = servers.iter().map(|s| u64::from(s.weight)).sum();
    let count = u64::from(virtual_node_count);

    let mut targets: Vec<u32> = servers
        .iter()
        .map(|s| (u64::from(s.weight) * count / total_weight) as u32)
        .collect();
    if let Some(last) = targets.last_mut() {
        *last = 0;
        let used: u32 = targets.iter().sum();
        targets[servers.len() - 1] = virtual_node_count - used;
    }
    targets
}
