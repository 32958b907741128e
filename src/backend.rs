//! The capability boundary between the gateway and the key-value servers behind it.
//!
//! The gateway never speaks a wire protocol itself. It asks a [`Connector`] for a
//! [`BackendConnection`] to a given `host:port` and issues single-key operations on it.
use std::future::Future;

use crate::Error;

/// A live connection to one key-value backend.
pub trait BackendConnection {
    /// Fetches the value stored under `key`, `None` if the backend does not have it.
    fn get(&mut self, key: &[u8]) -> impl Future<Output = Result<Option<Vec<u8>>, Error>>;

    /// Stores `value` under `key`, expiring after `ttl` seconds.
    fn set(
        &mut self,
        key: &[u8],
        value: &[u8],
        ttl: u32,
    ) -> impl Future<Output = Result<(), Error>>;

    /// Removes `key`. Removing a key that does not exist is not an error.
    fn delete(&mut self, key: &[u8]) -> impl Future<Output = Result<(), Error>>;

    /// Whether the backend currently holds a live value for `key`.
    fn exists(&mut self, key: &[u8]) -> impl Future<Output = Result<bool, Error>>;
}

/// Opens [`BackendConnection`]s.
///
/// Implementations should report failure to reach the backend as [`Error::Connect`]. The gateway
/// bounds every call with its own connect timeout.
pub trait Connector {
    /// The connection type produced by this connector.
    type Connection: BackendConnection;

    /// Opens a new connection to `host:port`.
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Connection, Error>>;
}
