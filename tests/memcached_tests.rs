use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kvcluster::{ClusterConfig, ClusterGateway, Error, ErrorKind, ServerEntry, Status};

type Items = Arc<Mutex<HashMap<String, Vec<u8>>>>;

// A memcached stand-in understanding `get`, `set` and `delete` for single keys.
fn spawn_mock_memcached() -> (u16, Items) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let port = listener.local_addr().unwrap().port();
    let items = Items::default();

    let shared = items.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = stream.expect("Failed to accept connection");
            let items = shared.clone();
            std::thread::spawn(move || serve(stream, items));
        }
    });

    (port, items)
}

fn serve(mut stream: TcpStream, items: Items) {
    let mut reader = BufReader::new(stream.try_clone().expect("Failed to clone stream"));

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let parts: Vec<&str> = line.split_whitespace().collect();

        let response = match parts.as_slice() {
            ["get", key] => match items.lock().unwrap().get(*key) {
                Some(value) => {
                    let mut out = format!("VALUE {} 0 {}\r\n", key, value.len()).into_bytes();
                    out.extend_from_slice(value);
                    out.extend_from_slice(b"\r\nEND\r\n");
                    out
                }
                None => b"END\r\n".to_vec(),
            },
            ["set", key, _flags, _ttl, len] => {
                let len: usize = len.parse().expect("Invalid length");
                let mut data = vec![0; len + 2];
                reader.read_exact(&mut data).expect("Failed to read data");
                data.truncate(len);
                items.lock().unwrap().insert(key.to_string(), data);
                b"STORED\r\n".to_vec()
            }
            ["delete", key] => match items.lock().unwrap().remove(*key) {
                Some(_) => b"DELETED\r\n".to_vec(),
                None => b"NOT_FOUND\r\n".to_vec(),
            },
            _ => b"ERROR\r\n".to_vec(),
        };

        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

// A server that answers the very first command it sees with a line outside the protocol and
// every later `get` with a miss. Returns the port and the number of accepted connections.
fn spawn_garbling_memcached() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let garbled = Arc::new(AtomicBool::new(false));

    let counter = accepted.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = stream.expect("Failed to accept connection");
            counter.fetch_add(1, Ordering::SeqCst);
            let garbled = garbled.clone();
            std::thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while matches!(reader.read_line(&mut line), Ok(n) if n > 0) {
                    let reply: &[u8] = if garbled.swap(true, Ordering::SeqCst) {
                        b"END\r\n"
                    } else {
                        b"HELLO\r\n"
                    };
                    if stream.write_all(reply).is_err() {
                        return;
                    }
                    line.clear();
                }
            });
        }
    });

    (port, accepted)
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn cluster_config(dir: &std::path::Path, ports: &[u16]) -> ClusterConfig {
    ClusterConfig {
        real_servers: ports
            .iter()
            .map(|&port| ServerEntry::new("127.0.0.1", port, 10))
            .collect(),
        state_file: dir.join("state.db"),
        connect_timeout_ms: 500,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_keys_land_on_their_routed_server() {
    let dir = tempfile::tempdir().unwrap();
    let (port_a, items_a) = spawn_mock_memcached();
    let (port_b, items_b) = spawn_mock_memcached();
    let mut gateway = ClusterGateway::new(cluster_config(dir.path(), &[port_a, port_b])).unwrap();

    let keys: Vec<String> = (0..32).map(|i| format!("key-{}", i)).collect();
    for key in &keys {
        gateway.save(key, format!("value of {}", key), 0).await.unwrap();
    }

    for key in &keys {
        assert_eq!(
            gateway.get(key).await,
            Ok(Some(format!("value of {}", key).into_bytes()))
        );

        let route = gateway.server_for(key).unwrap();
        let (owner, other) = if route.server.port == port_a {
            (&items_a, &items_b)
        } else {
            (&items_b, &items_a)
        };
        assert!(owner.lock().unwrap().contains_key(key));
        assert!(!other.lock().unwrap().contains_key(key));
    }

    assert!(!items_a.lock().unwrap().is_empty());
    assert!(!items_b.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_and_exists() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _items) = spawn_mock_memcached();
    let mut gateway = ClusterGateway::new(cluster_config(dir.path(), &[port])).unwrap();

    gateway.save("session:1", "payload", 30).await.unwrap();
    assert_eq!(gateway.exists("session:1").await, Ok(true));

    gateway.delete("session:1").await.unwrap();
    assert_eq!(gateway.exists("session:1").await, Ok(false));
    assert_eq!(gateway.get("session:1").await, Ok(None));
    assert_eq!(gateway.delete("session:1").await, Ok(()));
}

#[tokio::test]
async fn test_dead_server_fails_over() {
    let dir = tempfile::tempdir().unwrap();
    let (port, items) = spawn_mock_memcached();
    let dead = closed_port();
    let mut gateway = ClusterGateway::new(cluster_config(dir.path(), &[port, dead])).unwrap();

    for i in 0..16 {
        let key = format!("key-{}", i);
        gateway.save(&key, "value", 60).await.unwrap();
        assert_eq!(gateway.get(&key).await, Ok(Some(b"value".to_vec())));
    }

    assert_eq!(items.lock().unwrap().len(), 16);
}

#[tokio::test]
async fn test_all_servers_dead() {
    let dir = tempfile::tempdir().unwrap();
    let dead = closed_port();
    let mut gateway = ClusterGateway::new(cluster_config(dir.path(), &[dead])).unwrap();

    let result = gateway.get("anything").await;

    assert_eq!(
        result,
        Err(Error::BackendUnavailable {
            key: "anything".to_string(),
            attempted: vec![format!("127.0.0.1:{}", dead)],
        })
    );
}

#[tokio::test]
async fn test_malformed_reply_does_not_poison_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let (port, accepted) = spawn_garbling_memcached();
    let mut gateway = ClusterGateway::new(cluster_config(dir.path(), &[port])).unwrap();

    let first = gateway.get("k").await;
    assert!(
        matches!(first, Err(Error::Protocol(Status::Error(ErrorKind::Protocol(_))))),
        "{:?}",
        first
    );

    for _ in 0..3 {
        assert_eq!(gateway.get("k").await, Ok(None));
    }
    // The broken connection was dropped and replaced once; the new one is reused.
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}
