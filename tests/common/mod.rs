/// Common utilities for integration tests
use futures::future::poll_fn;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::{rustls, TlsAcceptor};
use tokio_util::compat::TokioAsyncReadCompatExt;
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use rev_tunnel::tls;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("rev-tunnel-test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("rev-tunnel-test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Build a TLS acceptor from PEM files
pub fn tls_acceptor(cert_path: &Path, key_path: &Path) -> TlsAcceptor {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path).expect("open cert"),
    ))
    .collect::<Result<Vec<_>, _>>()
    .expect("parse certs");

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path).expect("open key"),
    ))
    .expect("parse key")
    .expect("no key found");

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .expect("server config");

    TlsAcceptor::from(Arc::new(config))
}

/// Create a simple echo server; returns its port and a connection counter
pub async fn start_echo_server() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let port = listener.local_addr().expect("local addr").port();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    (port, connections)
}

/// How the mock broker reacts to a bind handshake
#[derive(Debug, Clone, Copy)]
pub enum BrokerBehavior {
    /// Acknowledge the bind and keep the connection alive
    Accept,
    /// Acknowledge the bind, then drop the connection (unexpected close)
    DropAfterBind,
    /// Reject the bind with an error frame
    Reject {
        level: &'static str,
        message: &'static str,
    },
}

/// In-process tunnel broker speaking the TLS transport's bind handshake
pub struct MockBroker {
    pub port: u16,
    pub bind_count: Arc<AtomicUsize>,
    open_tx: mpsc::UnboundedSender<oneshot::Sender<yamux::Stream>>,
}

impl MockBroker {
    /// Open a request stream toward the connected client
    pub async fn open_stream(&self) -> yamux::Stream {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx.send(reply_tx).expect("broker running");
        reply_rx.await.expect("broker connection alive")
    }
}

pub async fn start_mock_broker(behavior: BrokerBehavior) -> MockBroker {
    let (cert_path, key_path) = generate_test_certs();
    let acceptor = tls_acceptor(&cert_path, &key_path);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock broker");
    let port = listener.local_addr().expect("local addr").port();

    let bind_count = Arc::new(AtomicUsize::new(0));
    let (open_tx, mut open_rx) = mpsc::unbounded_channel::<oneshot::Sender<yamux::Stream>>();

    let binds = bind_count.clone();
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                break;
            };
            let mut tls = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(_) => continue,
            };

            // Read the length-prefixed bind frame
            let mut len_buf = [0u8; 4];
            if tls.read_exact(&mut len_buf).await.is_err() {
                continue;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut frame = vec![0u8; len];
            if tls.read_exact(&mut frame).await.is_err() {
                continue;
            }
            binds.fetch_add(1, Ordering::SeqCst);

            match behavior {
                BrokerBehavior::Reject { level, message } => {
                    let error = serde_json::json!({ "level": level, "message": message });
                    let payload = error.to_string();
                    let _ = tls.write_all(&[0u8]).await;
                    let _ = tls
                        .write_all(&(payload.len() as u32).to_be_bytes())
                        .await;
                    let _ = tls.write_all(payload.as_bytes()).await;
                    let _ = tls.flush().await;
                    continue;
                }
                BrokerBehavior::Accept | BrokerBehavior::DropAfterBind => {
                    let _ = tls.write_all(&[1u8]).await;
                    let _ = tls.flush().await;
                }
            }

            if matches!(behavior, BrokerBehavior::DropAfterBind) {
                drop(tls);
                continue;
            }

            // Server-side multiplexer; request streams are opened on demand
            let mut conn =
                YamuxConnection::new(tls.compat(), YamuxConfig::default(), YamuxMode::Server);
            loop {
                tokio::select! {
                    inbound = poll_fn(|cx| conn.poll_next_inbound(cx)) => match inbound {
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    },
                    request = open_rx.recv() => match request {
                        Some(reply) => match poll_fn(|cx| conn.poll_new_outbound(cx)).await {
                            Ok(stream) => {
                                let _ = reply.send(stream);
                            }
                            Err(_) => break,
                        },
                        None => return,
                    },
                }
            }
        }
    });

    MockBroker {
        port,
        bind_count,
        open_tx,
    }
}

/// A request observed by the mock control plane
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: String,
}

/// Minimal recording control-plane server with canned JSON responses
pub struct MockControlPlane {
    pub port: u16,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockControlPlane {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn recorded(&self, method: &str, path: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .cloned()
            .collect()
    }

    pub fn delete_count(&self) -> usize {
        self.recorded("DELETE", "/connections").len()
    }
}

pub async fn start_mock_control_plane(
    connection: serde_json::Value,
    ping_reply: &'static str,
) -> MockControlPlane {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock control plane");
    let port = listener.local_addr().expect("local addr").port();
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));

    let recorded = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let connection = connection.clone();
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let mut buf: Vec<u8> = Vec::new();
                let mut tmp = [0u8; 2048];
                let header_end = loop {
                    match socket.read(&mut tmp).await {
                        Ok(0) => return,
                        Ok(n) => {
                            buf.extend_from_slice(&tmp[..n]);
                            if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                                break pos + 4;
                            }
                            if buf.len() > 64 * 1024 {
                                return;
                            }
                        }
                        Err(_) => return,
                    }
                };

                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let request_line = head.lines().next().unwrap_or("");
                let mut parts = request_line.split(' ');
                let method = parts.next().unwrap_or("").to_string();
                let target = parts.next().unwrap_or("").to_string();

                let content_length = head
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length: ")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);

                let mut body = buf[header_end..].to_vec();
                while body.len() < content_length {
                    match socket.read(&mut tmp).await {
                        Ok(0) => break,
                        Ok(n) => body.extend_from_slice(&tmp[..n]),
                        Err(_) => break,
                    }
                }

                let (path, query) = match target.split_once('?') {
                    Some((p, q)) => (p.to_string(), q.to_string()),
                    None => (target.clone(), String::new()),
                };

                let response_body = match (method.as_str(), path.as_str()) {
                    ("POST", "/connections") => {
                        serde_json::json!({ "connection": connection }).to_string()
                    }
                    ("GET", "/connections/ping") => {
                        format!(r#"{{"type":"{}"}}"#, ping_reply)
                    }
                    _ => "{}".to_string(),
                };

                recorded.lock().unwrap().push(RecordedRequest {
                    method,
                    path,
                    query,
                    body: String::from_utf8_lossy(&body).to_string(),
                });

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    response_body.len(),
                    response_body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    MockControlPlane { port, requests }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
