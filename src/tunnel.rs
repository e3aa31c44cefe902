//! Per-connection state (§3 `Tunnel`/`AccessEvent` of the design).

use std::net::SocketAddr;
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    HttpForward,
    HttpConnect,
    Socks4,
    Socks5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Negotiate,
    UpstreamHandshake,
    Relay,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    TcpTunnel,
    TcpMiss,
    TcpDenied,
}

/// Ephemeral per-connection state, owned exclusively by the handler task
/// that negotiated it. Never cloned, never shared across tasks.
pub struct Tunnel {
    pub protocol: Protocol,
    pub phase: Phase,
    pub target_host: String,
    pub target_port: u16,
    pub bytes_client_to_upstream: u64,
    pub bytes_upstream_to_client: u64,
    pub start_time: Instant,
    pub client_addr: SocketAddr,
}

impl Tunnel {
    pub fn new(protocol: Protocol, client_addr: SocketAddr) -> Self {
        Tunnel {
            protocol,
            phase: Phase::Negotiate,
            target_host: String::new(),
            target_port: 0,
            bytes_client_to_upstream: 0,
            bytes_upstream_to_client: 0,
            start_time: Instant::now(),
            client_addr,
        }
    }

    pub fn set_target(&mut self, host: impl Into<String>, port: u16) {
        self.target_host = host.into();
        self.target_port = port;
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    pub fn duration_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Build the [`AccessEvent`] for this tunnel. Called exactly once, when
    /// the tunnel transitions to `Closed`.
    pub fn finish(
        &self,
        action: Action,
        status_code: u16,
        method: Option<String>,
        content_type: Option<String>,
    ) -> AccessEvent {
        AccessEvent {
            timestamp_ms: unix_millis(),
            client_addr: self.client_addr.to_string(),
            action,
            status_code,
            bytes: self.bytes_client_to_upstream + self.bytes_upstream_to_client,
            method,
            target: self.target(),
            duration_ms: self.duration_ms(),
            content_type,
        }
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessEvent {
    pub timestamp_ms: u64,
    pub client_addr: String,
    pub action: Action,
    pub status_code: u16,
    pub bytes: u64,
    pub method: Option<String>,
    pub target: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}
