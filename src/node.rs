//! A Tokio-based memcached node.
use tracing::debug;

use crate::backend::{BackendConnection, Connector};
use crate::connection::Connection;
use crate::error::Error;

use crate::parser::{parse_ascii_response, Response};
use crate::parser::{ErrorKind, Status, Value};

/// A single memcached server connection speaking the ASCII protocol.
///
/// [`Node`] is mapped one-to-one with a given connection to a memcached server.
pub struct Node {
    conn: Connection,
}

impl Node {
    /// Connects a new [`Node`] to the memcached server at `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Node, Error> {
        let conn = Connection::tcp(host, port).await?;
        debug!(host, port, "connected to memcached node");

        Ok(Node { conn })
    }

    async fn get_read_write_response(&mut self) -> Result<Response, Error> {
        self.conn.receive(parse_ascii_response).await
    }

    /// Gets the given key.
    ///
    /// If the key is found, `Some(Value)` is returned, describing the metadata and data of the key.
    ///
    /// Otherwise, [`Error`] is returned.
    pub async fn get_value(&mut self, key: &[u8]) -> Result<Option<Value>, Error> {
        self.conn.send(&[b"get ", key, b"\r\n"]).await?;

        match self.get_read_write_response().await? {
            Response::Status(Status::NotFound) => Ok(None),
            Response::Status(s) => Err(s.into()),
            Response::Data(d) => d
                .map(|mut items| {
                    if items.len() != 1 {
                        Err(Status::Error(ErrorKind::Protocol(None)).into())
                    } else {
                        Ok(items.remove(0))
                    }
                })
                .transpose(),
        }
    }

    /// Sets the given key with the given expiration time.
    ///
    /// Flags are always written as 0. If the value is stored, `()` is returned, otherwise
    /// [`Error`] is returned.
    pub async fn set_value(&mut self, key: &[u8], value: &[u8], ttl: u32) -> Result<(), Error> {
        let header = format!(" 0 {} {}\r\n", ttl, value.len());
        self.conn
            .send(&[b"set ", key, header.as_bytes(), value, b"\r\n"])
            .await?;

        match self.get_read_write_response().await? {
            Response::Status(Status::Stored) => Ok(()),
            Response::Status(s) => Err(s.into()),
            _ => Err(Status::Error(ErrorKind::Protocol(None)).into()),
        }
    }

    /// Delete a key and wait for a reply.
    ///
    /// Returns whether the key was present.
    pub async fn delete_value(&mut self, key: &[u8]) -> Result<bool, Error> {
        self.conn.send(&[b"delete ", key, b"\r\n"]).await?;

        match self.get_read_write_response().await? {
            Response::Status(Status::Deleted) => Ok(true),
            Response::Status(Status::NotFound) => Ok(false),
            Response::Status(s) => Err(s.into()),
            _ => Err(Status::Error(ErrorKind::Protocol(None)).into()),
        }
    }
}

impl BackendConnection for Node {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.get_value(key).await?.map(|value| value.data))
    }

    async fn set(&mut self, key: &[u8], value: &[u8], ttl: u32) -> Result<(), Error> {
        self.set_value(key, value, ttl).await
    }

    async fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.delete_value(key).await.map(|_| ())
    }

    async fn exists(&mut self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get_value(key).await?.is_some())
    }
}

/// [`Connector`] producing memcached [`Node`]s over TCP.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemcachedConnector;

impl Connector for MemcachedConnector {
    type Connection = Node;

    async fn connect(&self, host: &str, port: u16) -> Result<Node, Error> {
        Node::connect(host, port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};

    // Minimal single-connection memcached stand-in: keeps one item in memory.
    fn spawn_mock_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let port = listener.local_addr().unwrap().port();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = stream.expect("Failed to accept connection");
                std::thread::spawn(move || handle_connection(stream));
            }
        });

        port
    }

    fn handle_connection(mut stream: TcpStream) {
        let mut reader = BufReader::new(stream.try_clone().expect("Failed to clone stream"));
        let mut stored: Option<(String, Vec<u8>)> = None;

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).expect("Failed to read line") == 0 {
                return;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();

            let response = match parts.as_slice() {
                ["get", "garbled"] => b"HELLO\r\n".to_vec(),
                ["get", key] => match &stored {
                    Some((k, v)) if k == key => {
                        let mut out = format!("VALUE {} 0 {}\r\n", key, v.len()).into_bytes();
                        out.extend_from_slice(v);
                        out.extend_from_slice(b"\r\nEND\r\n");
                        out
                    }
                    _ => b"END\r\n".to_vec(),
                },
                ["set", key, _flags, _ttl, len] => {
                    let len: usize = len.parse().expect("Invalid length");
                    let mut data = vec![0; len + 2];
                    reader.read_exact(&mut data).expect("Failed to read data");
                    data.truncate(len);
                    stored = Some((key.to_string(), data));
                    b"STORED\r\n".to_vec()
                }
                ["delete", key] => match &stored {
                    Some((k, _)) if k == key => {
                        stored = None;
                        b"DELETED\r\n".to_vec()
                    }
                    _ => b"NOT_FOUND\r\n".to_vec(),
                },
                _ => b"ERROR\r\n".to_vec(),
            };

            stream
                .write_all(&response)
                .expect("Failed to write response");
        }
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let port = spawn_mock_server();
        let mut node = Node::connect("127.0.0.1", port)
            .await
            .expect("Failed to connect to server");

        let key = b"async-memcache-test-key";
        assert_eq!(node.get(key).await, Ok(None));
        assert_eq!(node.exists(key).await, Ok(false));

        node.set(key, b"value\r\nwith newline", 60)
            .await
            .expect("Failed to set");
        assert_eq!(
            node.get(key).await,
            Ok(Some(b"value\r\nwith newline".to_vec()))
        );
        assert_eq!(node.exists(key).await, Ok(true));

        assert_eq!(node.delete_value(key).await, Ok(true));
        assert_eq!(node.delete_value(key).await, Ok(false));
        assert_eq!(node.get(key).await, Ok(None));
    }

    #[tokio::test]
    async fn test_unknown_command_reply_is_protocol_error() {
        let port = spawn_mock_server();
        let mut node = Node::connect("127.0.0.1", port)
            .await
            .expect("Failed to connect to server");

        // A key with a space splits into an extra token the mock does not understand.
        let result = node.get(b"two words").await;

        assert_eq!(
            result,
            Err(Error::Protocol(Status::Error(ErrorKind::NonexistentCommand)))
        );
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_discarded() {
        let port = spawn_mock_server();
        let mut node = Node::connect("127.0.0.1", port)
            .await
            .expect("Failed to connect to server");

        let result = node.get(b"garbled").await;
        assert!(
            matches!(result, Err(Error::Protocol(Status::Error(ErrorKind::Protocol(_))))),
            "{:?}",
            result
        );

        // The bad line is not parsed again on the next request.
        assert_eq!(node.get(b"other").await, Ok(None));
        node.set(b"other", b"v", 0).await.expect("Failed to set");
        assert_eq!(node.get(b"other").await, Ok(Some(b"v".to_vec())));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = MemcachedConnector.connect("127.0.0.1", port).await;

        assert!(matches!(result, Err(Error::Connect(_))));
    }
}
