//! Upstream dialer + HTTP-CONNECT bridge (§4.6).
//!
//! `dial_and_connect` is the one function every protocol path (HTTP
//! CONNECT, HTTP forward, SOCKS4, SOCKS5) reuses: open TCP (optionally
//! TLS-wrapped) to the configured upstream, send `CONNECT host:port`, and
//! return a live connection once the upstream has replied 2xx.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use log::debug;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::config::Config;
use crate::error::{Error, Result};

/// Either a plain TCP connection or a TLS-wrapped one to the upstream
/// proxy. The relay and the CONNECT bridge are generic over
/// `AsyncRead + AsyncWrite`, so callers never need to distinguish the two
/// after `dial_and_connect` returns.
pub enum UpstreamConn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamConn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamConn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamConn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamConn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamConn::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamConn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamConn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamConn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Builds the ambient trust store once and reuses it for every dial.
/// Mirrors the `rustls-native-certs` pattern used to seed a client
/// `RootCertStore` in the retrieval pack's gateway example. When
/// `upstream_ca_file` is set, its certificates are added on top of the
/// system trust store rather than replacing it.
pub fn build_tls_connector(upstream_ca_file: Option<&str>) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().map_err(|e| {
        Error::ConfigInvalid(format!("failed to load native trust store: {e}"))
    })? {
        let _ = root_store.add(cert);
    }

    if let Some(path) = upstream_ca_file {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::ConfigInvalid(format!("failed to open upstream CA file {path}: {e}")))?;
        let mut reader = std::io::BufReader::new(file);
        let extra_certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
        let extra_certs = extra_certs
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse upstream CA file {path}: {e}")))?;
        root_store.add_parsable_certificates(extra_certs);
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Opens TCP (optionally TLS) to `Config.upstream_host:upstream_port`.
/// Shared by the CONNECT bridge below and the HTTP forward path, which
/// dials the same upstream but never sends a CONNECT handshake.
pub async fn dial_upstream(config: &Config, tls_connector: Option<&TlsConnector>) -> Result<UpstreamConn> {
    let tcp = timeout(
        Duration::from_millis(config.connect_timeout_ms),
        TcpStream::connect((config.upstream_host.as_str(), config.upstream_port)),
    )
    .await
    .map_err(|_| Error::UpstreamDialFailed {
        host: config.upstream_host.clone(),
        port: config.upstream_port,
        source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
    })?
    .map_err(|e| Error::UpstreamDialFailed {
        host: config.upstream_host.clone(),
        port: config.upstream_port,
        source: e,
    })?;

    if config.upstream_tls {
        let connector = tls_connector.ok_or_else(|| {
            Error::ConfigInvalid("upstream.tls enabled but no TLS connector configured".into())
        })?;
        let server_name = ServerName::try_from(config.upstream_host.clone()).map_err(|_| {
            Error::UpstreamTlsFailed {
                host: config.upstream_host.clone(),
                port: config.upstream_port,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid upstream host for TLS SNI",
                ),
            }
        })?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::UpstreamTlsFailed {
                host: config.upstream_host.clone(),
                port: config.upstream_port,
                source: e,
            })?;
        Ok(UpstreamConn::Tls(Box::new(tls)))
    } else {
        Ok(UpstreamConn::Plain(tcp))
    }
}

/// Dials the upstream and performs the CONNECT handshake for
/// `(target_host, target_port)`, returning the live upstream connection on
/// a 2xx reply. Reused verbatim by HTTP CONNECT, SOCKS4 and SOCKS5.
pub async fn dial_and_connect(
    config: &Config,
    tls_connector: Option<&TlsConnector>,
    target_host: &str,
    target_port: u16,
) -> Result<UpstreamConn> {
    let mut conn = dial_upstream(config, tls_connector).await?;

    send_connect_request(&mut conn, target_host, target_port, config.upstream_auth_header.as_deref())
        .await?;
    read_connect_response(&mut conn, config.read_timeout_ms).await?;

    Ok(conn)
}

async fn send_connect_request(
    conn: &mut UpstreamConn,
    target_host: &str,
    target_port: u16,
    upstream_auth_header: Option<&str>,
) -> Result<()> {
    let target = format_host_port(target_host, target_port);
    let mut request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n"
    );
    if let Some(auth) = upstream_auth_header {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    conn.write_all(request.as_bytes())
        .await
        .map_err(Error::RelayIo)?;
    conn.flush().await.map_err(Error::RelayIo)?;
    Ok(())
}

/// Formats a `host:port` CONNECT target, bracketing `host` per RFC 3986 when
/// it is a bare (unbracketed) IPv6 literal — e.g. the address a SOCKS5
/// ATYP=0x04 request carries — so `CONNECT ::1:443` never becomes ambiguous.
fn format_host_port(host: &str, port: u16) -> String {
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Reads the upstream's CONNECT response line + headers up to `\r\n\r\n`,
/// accepting only 2xx. Any bytes read past the header terminator belong to
/// the relay phase and must never be discarded — there are none here
/// because the upstream CONNECT response has no body, but a defensive
/// implementation would buffer and hand them back to the relay.
async fn read_connect_response(conn: &mut UpstreamConn, read_timeout_ms: u64) -> Result<()> {
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];

    loop {
        let n = timeout(Duration::from_millis(read_timeout_ms), conn.read(&mut byte))
            .await
            .map_err(|_| Error::UpstreamHandshakeTimeout)?
            .map_err(Error::RelayIo)?;

        if n == 0 {
            return Err(Error::UpstreamHandshakeMalformed);
        }
        buf.push(byte[0]);

        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if buf.len() > 16 * 1024 {
            return Err(Error::UpstreamHandshakeMalformed);
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let status_line = text
        .lines()
        .next()
        .ok_or(Error::UpstreamHandshakeMalformed)?;
    let (status_code, reason) = parse_status_line(status_line)?;

    debug!("upstream CONNECT replied {status_code} {reason}");

    if (200..300).contains(&status_code) {
        Ok(())
    } else {
        Err(Error::UpstreamHandshakeStatus { code: status_code, reason })
    }
}

/// Splits a status line into its numeric code and the upstream's own reason
/// phrase, the latter carried verbatim back to the client (§8 scenario 6
/// requires the client see the upstream's actual status line, not a
/// fabricated one).
fn parse_status_line(status_line: &str) -> Result<(u16, String)> {
    let mut parts = status_line.trim_end_matches('\r').splitn(3, ' ');
    let _version = parts.next().ok_or(Error::UpstreamHandshakeMalformed)?;
    let code = parts
        .next()
        .ok_or(Error::UpstreamHandshakeMalformed)?
        .parse::<u16>()
        .map_err(|_| Error::UpstreamHandshakeMalformed)?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_code_and_reason_from_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK").unwrap(), (200, "OK".to_string()));
        assert_eq!(
            parse_status_line("HTTP/1.1 403 Forbidden").unwrap(),
            (403, "Forbidden".to_string())
        );
    }

    #[test]
    fn preserves_multi_word_reason_phrase() {
        assert_eq!(
            parse_status_line("HTTP/1.1 407 Proxy Authentication Required").unwrap(),
            (407, "Proxy Authentication Required".to_string())
        );
    }

    #[test]
    fn rejects_malformed_status_line() {
        assert!(parse_status_line("garbage").is_err());
        assert!(parse_status_line("HTTP/1.1 notanumber").is_err());
    }

    #[test]
    fn missing_ca_file_is_a_config_error() {
        let err = build_tls_connector(Some("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn connect_target_brackets_bare_ipv6_literal() {
        assert_eq!(format_host_port("::1", 443), "[::1]:443");
        assert_eq!(format_host_port("2001:db8::1", 8443), "[2001:db8::1]:8443");
    }

    #[test]
    fn connect_target_leaves_ipv4_and_domain_hosts_unbracketed() {
        assert_eq!(format_host_port("example.com", 443), "example.com:443");
        assert_eq!(format_host_port("127.0.0.1", 443), "127.0.0.1:443");
    }
}
