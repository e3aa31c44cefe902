//! End-to-end tests driving the HTTP front-end against a mock upstream
//! proxy, loopback only (§8 testable properties).

use std::sync::Arc;

use multiproxy::access_log::{AccessLog, NullAccessLog};
use multiproxy::config::{Args, Config};
use multiproxy::http_front::handle_connection;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn test_args(upstream_host: String, upstream_port: u16) -> Args {
    Args {
        listen_host: "127.0.0.1".into(),
        http_port: 0,
        socks_port: 0,
        listen_username: None,
        listen_password: None,
        upstream_host,
        upstream_port,
        upstream_tls: false,
        upstream_username: None,
        upstream_password: None,
        upstream_ca_file: None,
        connect_timeout_ms: 2_000,
        read_timeout_ms: 2_000,
        buffer_size: 4096,
        header_max_bytes: 16 * 1024,
        http_max_initial_bytes: 64 * 1024,
        pac_enabled: false,
        pac_path: "/proxy.pac".into(),
        pac_host: None,
        pac_file: None,
        server_name: "multiproxy".into(),
        log_level: "error".into(),
        access_log_file: None,
        access_log_console: false,
    }
}

/// Mock upstream proxy: accepts one connection, expects a CONNECT request,
/// replies 200, then echoes whatever it receives afterward.
async fn spawn_mock_upstream_connect_accept() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();

        let mut echo = [0u8; 64];
        let n = sock.read(&mut echo).await.unwrap();
        sock.write_all(&echo[..n]).await.unwrap();
    });

    port
}

#[tokio::test]
async fn http_connect_establishes_tunnel_and_relays_bytes() {
    let upstream_port = spawn_mock_upstream_connect_accept().await;
    let config = Arc::new(Config::from_args(test_args("127.0.0.1".into(), upstream_port)).unwrap());

    let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();

    let config_clone = config.clone();
    let access_log: Arc<dyn AccessLog> = Arc::new(NullAccessLog);
    tokio::spawn(async move {
        let (stream, addr) = front_listener.accept().await.unwrap();
        handle_connection(stream, addr, config_clone, None, access_log).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{upstream_port} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut response = [0u8; 128];
    let n = client.read(&mut response).await.unwrap();
    let response_text = String::from_utf8_lossy(&response[..n]);
    assert!(response_text.starts_with("HTTP/1.1 200"));

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn http_connect_bad_request_target_is_rejected() {
    let config = Arc::new(Config::from_args(test_args("127.0.0.1".into(), 1)).unwrap());

    let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();

    let access_log: Arc<dyn AccessLog> = Arc::new(NullAccessLog);
    tokio::spawn(async move {
        let (stream, addr) = front_listener.accept().await.unwrap();
        handle_connection(stream, addr, config, None, access_log).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(b"CONNECT :::: HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    let mut response = [0u8; 128];
    let n = client.read(&mut response).await.unwrap();
    let response_text = String::from_utf8_lossy(&response[..n]);
    assert!(response_text.starts_with("HTTP/1.1 400"));
}

/// Mock upstream proxy that replies with a non-2xx CONNECT status, reason
/// phrase included, and closes without relaying anything.
async fn spawn_mock_upstream_connect_reject(status_line: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        sock.write_all(format!("{status_line}\r\n\r\n").as_bytes()).await.unwrap();
    });

    port
}

#[tokio::test]
async fn http_connect_surfaces_upstream_rejection_reason_verbatim() {
    let upstream_port = spawn_mock_upstream_connect_reject("HTTP/1.1 403 Forbidden").await;
    let config = Arc::new(Config::from_args(test_args("127.0.0.1".into(), upstream_port)).unwrap());

    let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();

    let access_log: Arc<dyn AccessLog> = Arc::new(NullAccessLog);
    tokio::spawn(async move {
        let (stream, addr) = front_listener.accept().await.unwrap();
        handle_connection(stream, addr, config, None, access_log).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{upstream_port} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = client.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
    }
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.starts_with("HTTP/1.1 403 Forbidden"));
    assert!(response_text.contains("Connection: close"));
}

#[tokio::test]
async fn http_connect_requires_client_auth_and_returns_407() {
    let mut args = test_args("127.0.0.1".into(), 1);
    args.listen_username = Some("alice".into());
    args.listen_password = Some("wonderland".into());
    let config = Arc::new(Config::from_args(args).unwrap());

    let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();

    let access_log: Arc<dyn AccessLog> = Arc::new(NullAccessLog);
    tokio::spawn(async move {
        let (stream, addr) = front_listener.accept().await.unwrap();
        handle_connection(stream, addr, config, None, access_log).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = client.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
    }
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.starts_with("HTTP/1.1 407"));
    assert!(response_text.contains("Proxy-Authenticate: Basic realm="));
}

#[tokio::test]
async fn http_request_head_exactly_at_max_bytes_is_accepted() {
    let upstream_port = spawn_mock_upstream_connect_accept().await;
    let mut args = test_args("127.0.0.1".into(), upstream_port);
    let prefix = b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: x\r\nX-Pad: ";
    let suffix = b"\r\n\r\n";
    let pad_len = 256 - prefix.len() - suffix.len();
    args.header_max_bytes = 256;
    let config = Arc::new(Config::from_args(args).unwrap());

    let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();

    let access_log: Arc<dyn AccessLog> = Arc::new(NullAccessLog);
    tokio::spawn(async move {
        let (stream, addr) = front_listener.accept().await.unwrap();
        handle_connection(stream, addr, config, None, access_log).await;
    });

    let mut request = Vec::new();
    request.extend_from_slice(prefix);
    request.extend_from_slice(&vec![b'a'; pad_len]);
    request.extend_from_slice(suffix);
    assert_eq!(request.len(), 256);

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(&request).await.unwrap();

    let mut response = [0u8; 128];
    let n = client.read(&mut response).await.unwrap();
    let response_text = String::from_utf8_lossy(&response[..n]);
    assert!(response_text.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn http_request_head_one_byte_over_max_bytes_is_rejected() {
    let mut args = test_args("127.0.0.1".into(), 1);
    let prefix = b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: x\r\nX-Pad: ";
    let suffix = b"\r\n\r\n";
    args.header_max_bytes = 256;
    let pad_len = 256 - prefix.len() - suffix.len() + 1;
    let config = Arc::new(Config::from_args(args).unwrap());

    let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();

    let access_log: Arc<dyn AccessLog> = Arc::new(NullAccessLog);
    tokio::spawn(async move {
        let (stream, addr) = front_listener.accept().await.unwrap();
        handle_connection(stream, addr, config, None, access_log).await;
    });

    let mut request = Vec::new();
    request.extend_from_slice(prefix);
    request.extend_from_slice(&vec![b'a'; pad_len]);
    request.extend_from_slice(suffix);
    assert_eq!(request.len(), 257);

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(&request).await.unwrap();

    let mut response = [0u8; 128];
    let n = client.read(&mut response).await.unwrap();
    let response_text = String::from_utf8_lossy(&response[..n]);
    assert!(response_text.starts_with("HTTP/1.1 400"));
}
