//! Unified SOCKS4/4a + SOCKS5 state machine (§4.5).
//!
//! A single handler peeks the first byte to version-dispatch: `0x04` for
//! SOCKS4(a), `0x05` for SOCKS5. Both branches bottom out in the same
//! [`dial_and_connect`] bridge used by the HTTP CONNECT path.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use log::warn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::access_log::AccessLog;
use crate::config::{basic_auth_header, Config};
use crate::error::{Error, Result};
use crate::relay::relay;
use crate::tunnel::{Action, Phase, Protocol, Tunnel};
use crate::upstream::dial_and_connect;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;

/// Handles one accepted TCP connection on the SOCKS listener end to end.
pub async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    config: Arc<Config>,
    tls_connector: Option<Arc<TlsConnector>>,
    access_log: Arc<dyn AccessLog>,
) {
    let mut version = [0u8; 1];
    if client.read_exact(&mut version).await.is_err() {
        return;
    }

    let result = match version[0] {
        SOCKS4_VERSION => {
            let mut tunnel = Tunnel::new(Protocol::Socks4, client_addr);
            handle_socks4(client, &mut tunnel, &config, tls_connector.as_deref(), &access_log).await
        }
        SOCKS5_VERSION => {
            let mut tunnel = Tunnel::new(Protocol::Socks5, client_addr);
            handle_socks5(client, &mut tunnel, &config, tls_connector.as_deref(), &access_log).await
        }
        _ => {
            warn!("closing SOCKS connection from {client_addr}: unrecognised version byte");
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("SOCKS session from {client_addr} failed: {e}");
    }
}

/// SOCKS4/4a CONNECT: `CD=1, DSTPORT(2), DSTIP(4), USERID\0, [DOMAIN\0]`.
/// Takes `client` by value so the final reply path can move it straight
/// into the relay with no cloning.
async fn handle_socks4(
    mut client: TcpStream,
    tunnel: &mut Tunnel,
    config: &Config,
    tls_connector: Option<&TlsConnector>,
    access_log: &Arc<dyn AccessLog>,
) -> Result<()> {
    let mut head = [0u8; 7];
    client.read_exact(&mut head).await.map_err(Error::RelayIo)?;
    let command = head[0];
    let port = u16::from_be_bytes([head[1], head[2]]);
    let ip = Ipv4Addr::new(head[3], head[4], head[5], head[6]);

    read_until_nul(&mut client, 256).await?;

    if command != 0x01 {
        write_socks4_reply(&mut client, 0x5B).await?;
        access_log.record(tunnel.finish(Action::TcpDenied, 0, None, None));
        return Ok(());
    }

    let octets = ip.octets();
    let is_socks4a = octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0;
    let host = if is_socks4a {
        String::from_utf8(read_until_nul(&mut client, 256).await?)
            .map_err(|_| Error::ClientHandshakeMalformed("invalid SOCKS4a domain".into()))?
    } else {
        ip.to_string()
    };

    tunnel.set_target(host.clone(), port);
    tunnel.phase = Phase::UpstreamHandshake;

    match dial_and_connect(config, tls_connector, &host, port).await {
        Ok(upstream) => {
            tunnel.phase = Phase::Relay;
            write_socks4_reply(&mut client, 0x5A).await?;
            if let Err(e) = relay(client, upstream, config.buffer_size).await {
                warn!("SOCKS4 relay ended: {e}");
            }
            access_log.record(tunnel.finish(Action::TcpTunnel, 0, None, None));
        }
        Err(_) => {
            write_socks4_reply(&mut client, 0x5B).await?;
            access_log.record(tunnel.finish(Action::TcpTunnel, 0, None, None));
        }
    }
    Ok(())
}

async fn write_socks4_reply(client: &mut TcpStream, code: u8) -> Result<()> {
    // VN=0, CD=code, DSTPORT=0, DSTIP=0.0.0.0
    let reply = [0x00, code, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    client.write_all(&reply).await.map_err(Error::RelayIo)?;
    client.flush().await.map_err(Error::RelayIo)?;
    Ok(())
}

async fn read_until_nul(client: &mut TcpStream, max_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        client.read_exact(&mut byte).await.map_err(Error::RelayIo)?;
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
        if out.len() > max_len {
            return Err(Error::ClientHandshakeMalformed("SOCKS4 field exceeded max length".into()));
        }
    }
}

/// SOCKS5: method negotiation, optional RFC 1929 sub-negotiation, CONNECT.
async fn handle_socks5(
    mut client: TcpStream,
    tunnel: &mut Tunnel,
    config: &Config,
    tls_connector: Option<&TlsConnector>,
    access_log: &Arc<dyn AccessLog>,
) -> Result<()> {
    let mut nmethods = [0u8; 1];
    client.read_exact(&mut nmethods).await.map_err(Error::RelayIo)?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    if !methods.is_empty() {
        client.read_exact(&mut methods).await.map_err(Error::RelayIo)?;
    }

    let chosen = negotiate_method(&methods, config.require_client_auth);
    client
        .write_all(&[SOCKS5_VERSION, chosen])
        .await
        .map_err(Error::RelayIo)?;
    client.flush().await.map_err(Error::RelayIo)?;

    if chosen == 0xFF {
        access_log.record(tunnel.finish(Action::TcpDenied, 0, None, None));
        return Ok(());
    }

    if chosen == 0x02 && !sub_negotiate(&mut client, config).await? {
        access_log.record(tunnel.finish(Action::TcpDenied, 0, None, None));
        return Ok(());
    }

    let mut req_head = [0u8; 4];
    client.read_exact(&mut req_head).await.map_err(Error::RelayIo)?;
    let command = req_head[1];
    let atyp = req_head[3];

    let host = match atyp {
        0x01 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await.map_err(Error::RelayIo)?;
            Ipv4Addr::from(octets).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await.map_err(Error::RelayIo)?;
            let mut domain = vec![0u8; len[0] as usize];
            client.read_exact(&mut domain).await.map_err(Error::RelayIo)?;
            String::from_utf8(domain).map_err(|_| Error::ClientHandshakeMalformed("invalid SOCKS5 domain".into()))?
        }
        0x04 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await.map_err(Error::RelayIo)?;
            Ipv6Addr::from(octets).to_string()
        }
        _ => {
            write_socks5_reply(&mut client, 0x08).await?;
            access_log.record(tunnel.finish(Action::TcpDenied, 0, None, None));
            return Ok(());
        }
    };

    let mut port_bytes = [0u8; 2];
    client.read_exact(&mut port_bytes).await.map_err(Error::RelayIo)?;
    let port = u16::from_be_bytes(port_bytes);

    if command != 0x01 {
        write_socks5_reply(&mut client, 0x07).await?;
        access_log.record(tunnel.finish(Action::TcpDenied, 0, None, None));
        return Ok(());
    }

    tunnel.set_target(host.clone(), port);
    tunnel.phase = Phase::UpstreamHandshake;

    match dial_and_connect(config, tls_connector, &host, port).await {
        Ok(upstream) => {
            tunnel.phase = Phase::Relay;
            write_socks5_reply(&mut client, 0x00).await?;
            if let Err(e) = relay(client, upstream, config.buffer_size).await {
                warn!("SOCKS5 relay ended: {e}");
            }
            access_log.record(tunnel.finish(Action::TcpTunnel, 0, None, None));
        }
        Err(Error::UpstreamDialFailed { .. }) => {
            write_socks5_reply(&mut client, 0x05).await?;
            access_log.record(tunnel.finish(Action::TcpTunnel, 0, None, None));
        }
        Err(_) => {
            write_socks5_reply(&mut client, 0x01).await?;
            access_log.record(tunnel.finish(Action::TcpTunnel, 0, None, None));
        }
    }
    Ok(())
}

fn negotiate_method(methods: &[u8], require_client_auth: bool) -> u8 {
    if require_client_auth {
        if methods.contains(&0x02) {
            0x02
        } else {
            0xFF
        }
    } else {
        0x00
    }
}

async fn sub_negotiate(client: &mut TcpStream, config: &Config) -> Result<bool> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await.map_err(Error::RelayIo)?;
    let ulen = head[1] as usize;
    let mut uname = vec![0u8; ulen];
    client.read_exact(&mut uname).await.map_err(Error::RelayIo)?;

    let mut plen = [0u8; 1];
    client.read_exact(&mut plen).await.map_err(Error::RelayIo)?;
    let mut passwd = vec![0u8; plen[0] as usize];
    client.read_exact(&mut passwd).await.map_err(Error::RelayIo)?;

    let uname = String::from_utf8_lossy(&uname);
    let passwd = String::from_utf8_lossy(&passwd);
    let candidate = basic_auth_header(&uname, &passwd);

    let ok = config
        .client_auth_expected
        .as_deref()
        .map(|expected| expected == candidate)
        .unwrap_or(false);

    client
        .write_all(&[0x01, if ok { 0x00 } else { 0x01 }])
        .await
        .map_err(Error::RelayIo)?;
    client.flush().await.map_err(Error::RelayIo)?;
    Ok(ok)
}

async fn write_socks5_reply(client: &mut TcpStream, rep: u8) -> Result<()> {
    // BND.ADDR/BND.PORT are zeros (decided Open Question).
    let reply = [SOCKS5_VERSION, rep, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    client.write_all(&reply).await.map_err(Error::RelayIo)?;
    client.flush().await.map_err(Error::RelayIo)?;
    Ok(())
}
