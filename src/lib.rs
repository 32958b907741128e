//! A gateway that spreads keys over a weighted cluster of key-value servers.
//!
//! Keys hash onto a fixed space of virtual nodes, and virtual nodes are assigned to real servers in
//! proportion to their weight. The assignment is persisted next to the application so that every
//! process of a deployment routes identically, and it is remapped with minimal movement whenever
//! the server list changes.
#![deny(missing_docs)]
use std::sync::Arc;

use fxhash::FxHashMap;
use tokio::time;
use tracing::{debug, info, warn};

mod backend;
pub use self::backend::{BackendConnection, Connector};

mod cache;
pub use self::cache::{CacheAdapter, Clock, LocalCache, RefreshReason, SystemClock, DEFAULT_TTL};

mod config;
pub use self::config::{ClusterConfig, ServerEntry};

mod connection;
mod error;
pub use self::error::Error;

mod node;
pub use self::node::{MemcachedConnector, Node};

mod parser;
pub use self::parser::{ErrorKind, Status, Value};

mod server_map;
pub use self::server_map::{RealServer, ServerMap, DEFAULT_VIRTUAL_NODE_COUNT, MIN_WEIGHT};

mod state;
pub use self::state::StateStore;
use self::state::MapStore;

/// Cache key under which the computed server map is memoized.
pub const SERVER_MAP_CACHE_KEY: &str = "_ServerMapState";

/// Longest key, in bytes, that is passed on to a backend.
pub const MAX_KEY_LENGTH: usize = 250;

/// Expiration written for values saved with a TTL of zero.
pub const UNBOUNDED_TTL: u32 = 0x7FFF_FFFF;

type ServerId = (String, u16);

/// Where a key is routed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Virtual node the key hashes onto.
    pub virtual_node: u32,
    /// Index of the owning server in the map's server list.
    pub server_index: usize,
    /// The owning server.
    pub server: RealServer,
}

/// High-level cluster client.
///
/// [`ClusterGateway`] owns the cluster configuration, a memoized [`ServerMap`] and one cached
/// connection per backend. Each operation routes its key to a virtual node, resolves the owning
/// server and, if that server cannot be reached, falls back to the next servers in the list within
/// the configured probe window.
pub struct ClusterGateway<C: Connector = MemcachedConnector, A = LocalCache<Arc<ServerMap>>> {
    config: ClusterConfig,
    store: StateStore,
    cache: A,
    connector: C,
    connections: FxHashMap<ServerId, C::Connection>,
}

impl ClusterGateway {
    /// Creates a new [`ClusterGateway`] talking to memcached backends.
    ///
    /// The server map is resolved immediately, so an unusable configuration fails here.
    pub fn new(config: ClusterConfig) -> Result<ClusterGateway, Error> {
        ClusterGateway::with_connector(config, MemcachedConnector)
    }
}

impl<C: Connector> ClusterGateway<C> {
    /// Creates a new [`ClusterGateway`] opening backend connections through `connector`.
    pub fn with_connector(config: ClusterConfig, connector: C) -> Result<ClusterGateway<C>, Error> {
        ClusterGateway::with_parts(config, connector, LocalCache::new())
    }
}

impl<C, A> ClusterGateway<C, A>
where
    C: Connector,
    A: CacheAdapter<Arc<ServerMap>>,
{
    /// Creates a new [`ClusterGateway`] memoizing its server map in `cache`.
    ///
    /// Gateways of the same cluster may share one cache, e.g. through an [`Arc`].
    pub fn with_parts(
        config: ClusterConfig,
        connector: C,
        cache: A,
    ) -> Result<ClusterGateway<C, A>, Error> {
        let gateway = ClusterGateway {
            store: StateStore::new(config.state_file.clone()),
            config,
            cache,
            connector,
            connections: FxHashMap::default(),
        };
        gateway.server_map()?;
        Ok(gateway)
    }

    /// The active configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Installs a new configuration.
    ///
    /// The server map is recomputed lazily by the next operation, provided the new configuration
    /// carries a newer [`modified`](ClusterConfig::modified) token. Open connections are kept.
    pub fn update_config(&mut self, config: ClusterConfig) {
        debug!(
            modified = config.modified,
            servers = config.real_servers.len(),
            "installing cluster configuration"
        );
        self.store = StateStore::new(config.state_file.clone());
        self.config = config;
    }

    /// The current server map, refreshing it first if the configuration changed.
    ///
    /// Failures to read or write the persisted map are logged and the map computed in memory is
    /// used instead.
    pub fn server_map(&self) -> Result<Arc<ServerMap>, Error> {
        let (map, persist_error) = self.resolve_map()?;
        if let Some(e) = persist_error {
            warn!(
                path = %self.store.path().display(),
                error = %e,
                "server map persistence failed, continuing with the in-memory map"
            );
        }
        Ok(map)
    }

    /// Discards the memoized server map and recomputes it now.
    ///
    /// Unlike the lazy refresh done by every operation, a persistence failure is returned. The
    /// recomputed map stays in use either way.
    pub fn reload(&self) -> Result<Arc<ServerMap>, Error> {
        self.cache.delete(&self.cache_key());
        match self.resolve_map()? {
            (_, Some(e)) => Err(e),
            (map, None) => Ok(map),
        }
    }

    /// Routes `key` without contacting any backend.
    pub fn server_for(&self, key: &str) -> Result<Route, Error> {
        let key = normalize_key(key)?;
        let map = self.server_map()?;
        let server_index = map.server_index_for(key);

        Ok(Route {
            virtual_node: map.virtual_node_for(key),
            server_index,
            server: map.real_servers()[server_index].clone(),
        })
    }

    /// Gets the given key.
    ///
    /// If the key is found, `Some(data)` is returned. A missing key is `None`; backend failures
    /// are returned as [`Error`].
    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let key = normalize_key(key)?;
        let (id, mut conn) = self.checkout(key).await?;
        let result = conn.get(key.as_bytes()).await;
        self.checkin(id, conn, &result);
        result
    }

    /// Saves the given value under the given key.
    ///
    /// `ttl` is in seconds; 0 means the value does not expire and is sent as [`UNBOUNDED_TTL`].
    pub async fn save<V: AsRef<[u8]>>(&mut self, key: &str, value: V, ttl: u32) -> Result<(), Error> {
        let key = normalize_key(key)?;
        let ttl = if ttl == 0 { UNBOUNDED_TTL } else { ttl };
        let (id, mut conn) = self.checkout(key).await?;
        let result = conn.set(key.as_bytes(), value.as_ref(), ttl).await;
        self.checkin(id, conn, &result);
        result
    }

    /// Deletes the given key. Deleting a missing key succeeds.
    pub async fn delete(&mut self, key: &str) -> Result<(), Error> {
        let key = normalize_key(key)?;
        let (id, mut conn) = self.checkout(key).await?;
        let result = conn.delete(key.as_bytes()).await;
        self.checkin(id, conn, &result);
        result
    }

    /// Checks whether the given key currently holds a value.
    pub async fn exists(&mut self, key: &str) -> Result<bool, Error> {
        let key = normalize_key(key)?;
        let (id, mut conn) = self.checkout(key).await?;
        let result = conn.exists(key.as_bytes()).await;
        self.checkin(id, conn, &result);
        result
    }

    fn cache_key(&self) -> String {
        format!("{}:{}", self.store.path().display(), SERVER_MAP_CACHE_KEY)
    }

    fn resolve_map(&self) -> Result<(Arc<ServerMap>, Option<Error>), Error> {
        let mut persist_error = None;
        let map = self.cache.get(
            &self.cache_key(),
            self.config.modified,
            |reason, config: &ClusterConfig| {
                recompute(reason, config, &self.store, &mut persist_error)
            },
            &self.config,
            None,
        )?;
        Ok((map, persist_error))
    }

    /// Takes a connection for `key` out of the pool, opening one if needed.
    ///
    /// The owner of the key's virtual node is tried first, then the following servers in list
    /// order (wrapping) until the probe window is exhausted.
    async fn checkout(&mut self, key: &str) -> Result<(ServerId, C::Connection), Error> {
        let map = self.server_map()?;
        let servers = map.real_servers();
        let primary = map.server_index_for(key);
        let window = self.config.probe_window().min(servers.len());
        let connect_timeout = self.config.connect_timeout();

        let mut attempted = Vec::with_capacity(window);
        for offset in 0..window {
            let server = &servers[(primary + offset) % servers.len()];
            let id = (server.host.clone(), server.port);
            if let Some(conn) = self.connections.remove(&id) {
                return Ok((id, conn));
            }

            attempted.push(server.host_port());
            let connect = self.connector.connect(&server.host, server.port);
            match time::timeout(connect_timeout, connect).await {
                Ok(Ok(conn)) => {
                    if offset > 0 {
                        warn!(key, server = %server.host_port(), ?attempted, "failed over to backend");
                    } else {
                        debug!(key, server = %server.host_port(), "connected to backend");
                    }
                    return Ok((id, conn));
                }
                Ok(Err(e)) => {
                    warn!(key, server = %server.host_port(), error = %e, "backend connect failed")
                }
                Err(_) => warn!(
                    key,
                    server = %server.host_port(),
                    timeout_ms = connect_timeout.as_millis() as u64,
                    "backend connect timed out"
                ),
            }
        }

        Err(Error::BackendUnavailable {
            key: key.to_string(),
            attempted,
        })
    }

    /// Returns a connection to the pool unless the operation lost it.
    fn checkin<T>(&mut self, id: ServerId, conn: C::Connection, result: &Result<T, Error>) {
        match result {
            Err(e) if e.is_connection_loss() => {
                let (host, port) = id;
                warn!(%host, port, error = %e, "dropping backend connection");
            }
            _ => {
                self.connections.insert(id, conn);
            }
        }
    }
}

fn recompute<S: MapStore>(
    reason: RefreshReason,
    config: &ClusterConfig,
    store: &S,
    persist_error: &mut Option<Error>,
) -> Result<Arc<ServerMap>, Error> {
    let servers = config.real_servers()?;
    let count = config.virtual_node_count();

    // An unreadable file may still hold the map other processes route by; the map built here
    // then stays in memory and the file is left alone.
    let (persisted, writable) = match store.load() {
        Ok(map) => (map, true),
        Err(e) => {
            *persist_error = Some(e);
            (None, false)
        }
    };

    let (map, changed) = match persisted {
        Some(old) if old.virtual_node_count() == count => match old.remap(servers)? {
            Some(new) => (new, true),
            None => (old, false),
        },
        Some(old) => {
            info!(
                persisted = old.virtual_node_count(),
                configured = count,
                "virtual node count changed, rebuilding server map"
            );
            (ServerMap::build(servers, count)?, true)
        }
        None => {
            info!(
                ?reason,
                servers = servers.len(),
                virtual_node_count = count,
                "building server map"
            );
            (ServerMap::build(servers, count)?, true)
        }
    };

    if changed && writable {
        if let Err(e) = store.store(&map) {
            *persist_error = Some(e);
        }
    }

    Ok(Arc::new(map))
}

fn normalize_key(key: &str) -> Result<&str, Error> {
    let trimmed = key.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_KEY_LENGTH
        || trimmed.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(trimmed)
}
