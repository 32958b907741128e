//! Cluster configuration: the weighted server list and gateway tuning knobs.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::server_map::{RealServer, DEFAULT_VIRTUAL_NODE_COUNT, MIN_WEIGHT};

const DEFAULT_STATE_FILE: &str = "runtime/kvcluster.db";
const DEFAULT_PROBE_WINDOW: usize = 2;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// One configured backend, either spelled out or as a DSN string.
///
/// DSNs take the form `tcp://<host>:<port>?weight=<n>`; the scheme and the weight are optional.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ServerEntry {
    /// `tcp://host:port?weight=n` or `host:port`.
    Dsn(String),
    /// Explicit fields.
    Server {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: i64,
        /// Relative capacity; values below 10 are raised to 10.
        #[serde(default)]
        weight: i64,
    },
}

impl ServerEntry {
    /// Convenience constructor for the explicit form.
    pub fn new<S: Into<String>>(host: S, port: u16, weight: u32) -> ServerEntry {
        ServerEntry::Server {
            host: host.into(),
            port: i64::from(port),
            weight: i64::from(weight),
        }
    }

    fn resolve(&self) -> Result<(String, i64, i64), Error> {
        match self {
            ServerEntry::Server { host, port, weight } => Ok((host.clone(), *port, *weight)),
            ServerEntry::Dsn(dsn) => parse_dsn(dsn),
        }
    }
}

fn parse_dsn(dsn: &str) -> Result<(String, i64, i64), Error> {
    let dsn = dsn.trim();
    let url = if dsn.contains("://") {
        Url::parse(dsn)
    } else {
        Url::parse(&format!("tcp://{}", dsn))
    }
    .map_err(|e| Error::configuration(format!("invalid server DSN `{}`: {}", dsn, e)))?;

    if url.scheme() != "tcp" {
        return Err(Error::configuration(format!(
            "unsupported scheme `{}` in server DSN `{}`",
            url.scheme(),
            dsn
        )));
    }

    let weight = match url.query_pairs().find(|(k, _)| k == "weight") {
        Some((_, v)) => v.parse::<i64>().map_err(|_| {
            Error::configuration(format!("invalid weight `{}` in server DSN `{}`", v, dsn))
        })?,
        None => 0,
    };

    Ok((
        url.host_str().unwrap_or_default().to_string(),
        url.port().map(i64::from).unwrap_or(0),
        weight,
    ))
}

/// Configuration of a [`ClusterGateway`](crate::ClusterGateway).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Size of the virtual node space. Zero or negative selects 256.
    pub virtual_servers_count: i64,
    /// Backends in configuration order. Order matters: the last server absorbs rounding.
    pub real_servers: Vec<ServerEntry>,
    /// Where the computed server map is persisted.
    pub state_file: PathBuf,
    /// How many consecutive servers a key may fall back to when its owner is unreachable.
    pub probe_window: usize,
    /// Upper bound for a single backend connect attempt.
    pub connect_timeout_ms: u64,
    /// Freshness token of this configuration, normally its modification time in seconds.
    ///
    /// A negative value `-n` asks for a refresh at most every `n` seconds instead.
    #[serde(skip)]
    pub modified: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            virtual_servers_count: i64::from(DEFAULT_VIRTUAL_NODE_COUNT),
            real_servers: Vec::new(),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            probe_window: DEFAULT_PROBE_WINDOW,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            modified: 0,
        }
    }
}

impl ClusterConfig {
    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> Result<ClusterConfig, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid configuration: {}", e)))
    }

    /// Reads a JSON configuration file.
    ///
    /// The freshness token is set to the file's modification time, and a relative `state_file`
    /// is resolved against the directory holding the configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ClusterConfig, Error> {
        let path = path.as_ref();
        let read_error = |e: std::io::Error| {
            Error::configuration(format!("cannot read {}: {}", path.display(), e))
        };

        let json = fs::read_to_string(path).map_err(read_error)?;
        let mut config = ClusterConfig::from_json(&json)?;

        config.modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(read_error)?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if config.state_file.is_relative() {
            if let Some(dir) = path.parent() {
                config.state_file = dir.join(&config.state_file);
            }
        }

        Ok(config)
    }

    /// The virtual node count, with non-positive values replaced by the default.
    pub fn virtual_node_count(&self) -> u32 {
        if self.virtual_servers_count <= 0 {
            DEFAULT_VIRTUAL_NODE_COUNT
        } else {
            u32::try_from(self.virtual_servers_count).unwrap_or(u32::MAX)
        }
    }

    /// The probe window, never smaller than one.
    pub fn probe_window(&self) -> usize {
        self.probe_window.max(1)
    }

    /// The connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The normalized real server list.
    ///
    /// Entries without a host or with a port outside `1..=65535` are skipped. Hosts are trimmed
    /// and lower-cased, weights below 10 are raised to 10, and repeated `host:port` entries are
    /// merged into the first one by summing their weights. Fails when no usable entry remains.
    pub fn real_servers(&self) -> Result<Vec<RealServer>, Error> {
        let mut servers: Vec<RealServer> = Vec::new();
        let mut positions: HashMap<(String, u16), usize> = HashMap::new();

        for entry in &self.real_servers {
            let (host, port, weight) = entry.resolve()?;
            let host = host.trim().to_lowercase();
            let port = match u16::try_from(port) {
                Ok(port) if port > 0 => port,
                _ => continue,
            };
            if host.is_empty() {
                continue;
            }
            let weight = u32::try_from(weight.max(i64::from(MIN_WEIGHT))).unwrap_or(u32::MAX);

            match positions.get(&(host.clone(), port)) {
                Some(&k) => servers[k].weight = servers[k].weight.saturating_add(weight),
                None => {
                    positions.insert((host.clone(), port), servers.len());
                    servers.push(RealServer::new(host, port, weight));
                }
            }
        }

        if servers.is_empty() {
            return Err(Error::configuration("no real servers configured"));
        }
        Ok(servers)
    }
}
