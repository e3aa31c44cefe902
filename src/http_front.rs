//! HTTP front-end (§4.2, §4.3, §4.4): parses one inbound HTTP request,
//! routes it to PAC serving, client authentication, CONNECT tunnelling or
//! plain forwarding.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::access_log::AccessLog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pac;
use crate::relay::relay;
use crate::request::{parse_request_head, RequestHead};
use crate::tunnel::{Action, Phase, Protocol, Tunnel};
use crate::upstream::{dial_and_connect, dial_upstream};

/// Handles one accepted TCP connection on the HTTP listener end to end,
/// including emitting exactly one [`crate::tunnel::AccessEvent`].
pub async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    config: Arc<Config>,
    tls_connector: Option<Arc<TlsConnector>>,
    access_log: Arc<dyn AccessLog>,
) {
    let raw_head = match read_head(&mut client, config.header_max_bytes, config.read_timeout_ms).await {
        Ok(raw) => raw,
        Err(_) => {
            let tunnel = Tunnel::new(Protocol::HttpForward, client_addr);
            let _ = write_status_line(&mut client, 400, "Bad Request", true).await;
            access_log.record(tunnel.finish(Action::TcpDenied, 400, None, None));
            return;
        }
    };

    let head = match parse_request_head(&raw_head) {
        Ok(head) => head,
        Err(_) => {
            let tunnel = Tunnel::new(Protocol::HttpForward, client_addr);
            let _ = write_status_line(&mut client, 400, "Bad Request", true).await;
            access_log.record(tunnel.finish(Action::TcpDenied, 400, None, None));
            return;
        }
    };

    let is_connect = head.method.eq_ignore_ascii_case("CONNECT");
    let mut tunnel = Tunnel::new(
        if is_connect { Protocol::HttpConnect } else { Protocol::HttpForward },
        client_addr,
    );

    if head.method.eq_ignore_ascii_case("GET") && config.pac_enabled && head.target == config.pac_path {
        serve_pac(&mut client, &config).await;
        access_log.record(tunnel.finish(
            Action::TcpMiss,
            200,
            Some(head.method.clone()),
            Some(pac::CONTENT_TYPE.to_string()),
        ));
        return;
    }

    if config.require_client_auth && !client_auth_ok(&head, &config) {
        let _ = write_auth_required(&mut client, &config).await;
        warn!("rejected unauthenticated HTTP client {client_addr}");
        access_log.record(tunnel.finish(Action::TcpDenied, 407, Some(head.method.clone()), None));
        return;
    }

    if is_connect {
        handle_connect(client, &head, &mut tunnel, &config, tls_connector.as_deref(), &access_log).await;
    } else {
        handle_forward(client, &head, &raw_head, &mut tunnel, &config, tls_connector.as_deref(), &access_log).await;
    }
}

/// Reads into `buf` until `\r\n\r\n` or `max_bytes` is exceeded, refreshing
/// the rolling read deadline after every successful read. Returns the full
/// buffer, terminator included: any body bytes read in the same chunk past
/// the terminator belong to the caller, not to this function, and must not
/// be discarded — `rewrite_forward_request` locates the terminator itself
/// to split head from prefetched body.
async fn read_head(stream: &mut TcpStream, max_bytes: usize, read_timeout_ms: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = timeout(std::time::Duration::from_millis(read_timeout_ms), stream.read(&mut chunk))
            .await
            .map_err(|_| Error::ReadTimeout)?
            .map_err(Error::RelayIo)?;

        if n == 0 {
            return Err(Error::ClientHandshakeMalformed(
                "connection closed before request head completed".into(),
            ));
        }

        buf.extend_from_slice(&chunk[..n]);

        // Checked before the terminator search: a head that only reaches
        // `\r\n\r\n` by first growing past `max_bytes` must still be
        // rejected, per §8's `headerMaxBytes`/`headerMaxBytes+1` boundary.
        if buf.len() > max_bytes {
            return Err(Error::ClientHandshakeMalformed("request head exceeded header.maxBytes".into()));
        }

        if find_header_terminator(&buf).is_some() {
            return Ok(buf);
        }
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn client_auth_ok(head: &RequestHead, config: &Config) -> bool {
    match (&config.client_auth_expected, head.header("Proxy-Authorization")) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => false,
    }
}

async fn write_status_line(stream: &mut TcpStream, code: u16, reason: &str, close: bool) -> Result<()> {
    let mut response = format!("HTTP/1.1 {code} {reason}\r\n");
    if close {
        response.push_str("Connection: close\r\n");
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await.map_err(Error::RelayIo)?;
    stream.flush().await.map_err(Error::RelayIo)?;
    Ok(())
}

async fn write_auth_required(stream: &mut TcpStream, config: &Config) -> Result<()> {
    let response = format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"{}\"\r\nConnection: close\r\n\r\n",
        config.server_name
    );
    stream.write_all(response.as_bytes()).await.map_err(Error::RelayIo)?;
    stream.flush().await.map_err(Error::RelayIo)?;
    Ok(())
}

async fn serve_pac(stream: &mut TcpStream, config: &Config) {
    let body = pac::document(config).await;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        pac::CONTENT_TYPE,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

/// §4.3: HTTP CONNECT tunnelling.
async fn handle_connect(
    mut client: TcpStream,
    head: &RequestHead,
    tunnel: &mut Tunnel,
    config: &Config,
    tls_connector: Option<&TlsConnector>,
    access_log: &Arc<dyn AccessLog>,
) {
    let (host, port) = match extract_connect_target(&head.target) {
        Ok(pair) => pair,
        Err(_) => {
            let _ = write_status_line(&mut client, 400, "Bad Request", true).await;
            access_log.record(tunnel.finish(Action::TcpDenied, 400, Some(head.method.clone()), None));
            return;
        }
    };
    tunnel.set_target(host.clone(), port);
    tunnel.phase = Phase::UpstreamHandshake;

    match dial_and_connect(config, tls_connector, &host, port).await {
        Ok(upstream) => {
            tunnel.phase = Phase::Relay;
            if client.write_all(b"HTTP/1.1 200 Connection Established\r\nProxy-Connection: keep-alive\r\n\r\n").await.is_err()
                || client.flush().await.is_err()
            {
                access_log.record(tunnel.finish(Action::TcpTunnel, 200, Some(head.method.clone()), None));
                return;
            }

            match relay(client, upstream, config.buffer_size).await {
                Ok((c2u, u2c)) => {
                    tunnel.bytes_client_to_upstream = c2u;
                    tunnel.bytes_upstream_to_client = u2c;
                }
                Err(e) => debug!("CONNECT relay ended: {e}"),
            }
            access_log.record(tunnel.finish(Action::TcpTunnel, 200, Some(head.method.clone()), None));
        }
        Err(Error::UpstreamHandshakeStatus { code, reason }) => {
            let reason = if reason.is_empty() { "Error" } else { reason.as_str() };
            let _ = write_status_line(&mut client, code, reason, true).await;
            access_log.record(tunnel.finish(Action::TcpTunnel, code, Some(head.method.clone()), None));
        }
        Err(e) => {
            warn!("CONNECT to {host}:{port} failed: {e}");
            let _ = write_status_line(&mut client, 502, "Bad Gateway", true).await;
            access_log.record(tunnel.finish(Action::TcpTunnel, 502, Some(head.method.clone()), None));
        }
    }
}

/// §4.4: HTTP forward. Rewrites the request, streams it (and any remaining
/// body) to the upstream, then relays the response back.
async fn handle_forward(
    mut client: TcpStream,
    head: &RequestHead,
    raw_head: &[u8],
    tunnel: &mut Tunnel,
    config: &Config,
    tls_connector: Option<&TlsConnector>,
    access_log: &Arc<dyn AccessLog>,
) {
    let (host, port) = extract_forward_target(head);
    tunnel.set_target(host, port);
    tunnel.phase = Phase::UpstreamHandshake;

    let mut upstream = match dial_upstream(config, tls_connector).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("forward dial failed: {e}");
            let _ = write_status_line(&mut client, 502, "Bad Gateway", true).await;
            access_log.record(tunnel.finish(Action::TcpMiss, 502, Some(head.method.clone()), None));
            return;
        }
    };

    let rewritten = rewrite_forward_request(head, raw_head, config);
    if upstream.write_all(&rewritten).await.is_err() || upstream.flush().await.is_err() {
        let _ = write_status_line(&mut client, 502, "Bad Gateway", true).await;
        access_log.record(tunnel.finish(Action::TcpMiss, 502, Some(head.method.clone()), None));
        return;
    }

    tunnel.phase = Phase::Relay;
    match relay(client, upstream, config.buffer_size).await {
        Ok((c2u, u2c)) => {
            tunnel.bytes_client_to_upstream = c2u;
            tunnel.bytes_upstream_to_client = u2c;
        }
        Err(e) => debug!("forward relay ended: {e}"),
    }
    access_log.record(tunnel.finish(Action::TcpMiss, 200, Some(head.method.clone()), None));
}

/// §4.4 rewrite rules, applied in order: strip client `Proxy-Authorization`,
/// append the upstream one if configured, append `Proxy-Connection`,
/// preserve every other header (including `Host`) in original order.
fn rewrite_forward_request(head: &RequestHead, raw_head: &[u8], config: &Config) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", head.method, head.target, head.version).into_bytes();

    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("Proxy-Authorization") {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    if let Some(auth) = &config.upstream_auth_header {
        out.extend_from_slice(format!("Proxy-Authorization: {auth}\r\n").as_bytes());
    }
    out.extend_from_slice(b"Proxy-Connection: keep-alive\r\n");
    out.extend_from_slice(b"\r\n");

    // Bytes already read past the header terminator are body bytes that
    // were buffered ahead of the request head and must still be forwarded.
    if let Some(pos) = find_header_terminator(raw_head) {
        out.extend_from_slice(&raw_head[pos + 4..]);
    }

    out
}

fn extract_connect_target(target: &str) -> Result<(String, u16)> {
    if let Some(idx) = target.rfind(':') {
        let host = &target[..idx];
        let port: u16 = target[idx + 1..]
            .parse()
            .map_err(|_| Error::ClientHandshakeMalformed("invalid CONNECT port".into()))?;
        Ok((host.to_string(), port))
    } else {
        Ok((target.to_string(), 443))
    }
}

fn extract_forward_target(head: &RequestHead) -> (String, u16) {
    if let Some(rest) = head.target.strip_prefix("http://") {
        let authority = rest.split('/').next().unwrap_or(rest);
        return split_host_port(authority, 80);
    }
    if let Some(rest) = head.target.strip_prefix("https://") {
        let authority = rest.split('/').next().unwrap_or(rest);
        return split_host_port(authority, 443);
    }
    if let Some(host_header) = head.header("Host") {
        return split_host_port(host_header, 80);
    }
    (head.target.clone(), 80)
}

fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(idx) = authority.rfind(':') {
        if let Ok(port) = authority[idx + 1..].parse::<u16>() {
            return (authority[..idx].to_string(), port);
        }
    }
    (authority.to_string(), default_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_connect_target_defaults_port_443() {
        assert_eq!(extract_connect_target("example.com").unwrap(), ("example.com".into(), 443));
        assert_eq!(extract_connect_target("example.com:8443").unwrap(), ("example.com".into(), 8443));
    }

    #[test]
    fn extract_forward_target_prefers_absolute_uri() {
        let head = RequestHead {
            start_line: "GET http://x:81/ HTTP/1.1".into(),
            method: "GET".into(),
            target: "http://x:81/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Host".into(), "x".into())],
        };
        assert_eq!(extract_forward_target(&head), ("x".into(), 81));
    }

    #[test]
    fn extract_forward_target_falls_back_to_host_header() {
        let head = RequestHead {
            start_line: "GET / HTTP/1.1".into(),
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Host".into(), "x:8080".into())],
        };
        assert_eq!(extract_forward_target(&head), ("x".into(), 8080));
    }

    #[test]
    fn rewrite_drops_client_auth_and_injects_upstream_auth() {
        let head = RequestHead {
            start_line: "GET http://x/ HTTP/1.1".into(),
            method: "GET".into(),
            target: "http://x/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![
                ("Host".into(), "x".into()),
                ("Proxy-Authorization".into(), "Basic bogus".into()),
            ],
        };
        let raw = b"GET http://x/ HTTP/1.1\r\nHost: x\r\nProxy-Authorization: Basic bogus\r\n\r\n";
        let config = test_config_with_upstream_auth();
        let rewritten = rewrite_forward_request(&head, raw, &config);
        let text = String::from_utf8(rewritten).unwrap();
        assert!(!text.contains("Basic bogus"));
        assert!(text.contains("Proxy-Authorization: Basic dTpw"));
        assert!(text.contains("Proxy-Connection: keep-alive"));
        assert!(text.contains("Host: x"));
    }

    fn test_config_with_upstream_auth() -> Config {
        use crate::config::Args;
        Config::from_args(Args {
            listen_host: "127.0.0.1".into(),
            http_port: 8282,
            socks_port: 8383,
            listen_username: None,
            listen_password: None,
            upstream_host: "corp-proxy.example".into(),
            upstream_port: 443,
            upstream_tls: true,
            upstream_username: Some("u".into()),
            upstream_password: Some("p".into()),
            upstream_ca_file: None,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 120_000,
            buffer_size: 16 * 1024,
            header_max_bytes: 16 * 1024,
            http_max_initial_bytes: 64 * 1024,
            pac_enabled: false,
            pac_path: "/proxy.pac".into(),
            pac_host: None,
            pac_file: None,
            server_name: "multiproxy".into(),
            log_level: "info".into(),
            access_log_file: None,
            access_log_console: false,
        })
        .unwrap()
    }
}
