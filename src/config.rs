//! Configuration loading and validation.
//!
//! The core engine (§ the rest of this crate) only ever consumes a fully
//! resolved, immutable [`Config`]. This module is the one piece of "external
//! collaborator" plumbing this crate still ships so the binary is runnable:
//! flat CLI flags with environment-variable overrides via `clap`, no
//! property-file merging. Credentials are normalised and pre-encoded into
//! `Basic <base64>` tokens exactly once here, so the hot path never touches
//! base64 again.

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;

use crate::error::{Error, Result};

/// Command-line / environment surface. Kept separate from [`Config`] so that
/// validation and derived fields (pre-encoded auth headers) live in one
/// place, independent of how the raw values were sourced.
#[derive(Parser, Debug, Clone)]
#[command(name = "multiproxy", version, about, long_about = None)]
pub struct Args {
    /// Address the HTTP and SOCKS listeners bind to.
    #[arg(long = "listen-host", env = "LISTEN_HOST", default_value = "127.0.0.1")]
    pub listen_host: String,

    /// Port for the HTTP forward-proxy listener.
    #[arg(long = "http-port", env = "HTTP_PORT", default_value_t = 8282)]
    pub http_port: u16,

    /// Port for the SOCKS4/5 listener. Zero disables the SOCKS listener.
    #[arg(long = "socks-port", env = "SOCKS_PORT", default_value_t = 8383)]
    pub socks_port: u16,

    /// Username required of clients (requires `--listen-password` too).
    #[arg(long = "listen-username", env = "LISTEN_USERNAME")]
    pub listen_username: Option<String>,

    /// Password required of clients.
    #[arg(long = "listen-password", env = "LISTEN_PASSWORD")]
    pub listen_password: Option<String>,

    /// Upstream HTTP(S) forward proxy host. Required.
    #[arg(long = "upstream-host", env = "UPSTREAM_HOST")]
    pub upstream_host: String,

    /// Upstream forward proxy port.
    #[arg(long = "upstream-port", env = "UPSTREAM_PORT", default_value_t = 443)]
    pub upstream_port: u16,

    /// Wrap the upstream connection in TLS.
    #[arg(long = "upstream-tls", env = "UPSTREAM_TLS", default_value_t = true)]
    pub upstream_tls: bool,

    /// Username for Proxy-Authorization injected toward the upstream.
    #[arg(long = "upstream-username", env = "UPSTREAM_USERNAME")]
    pub upstream_username: Option<String>,

    /// Password for Proxy-Authorization injected toward the upstream.
    #[arg(long = "upstream-password", env = "UPSTREAM_PASSWORD")]
    pub upstream_password: Option<String>,

    /// Extra CA bundle (PEM) trusted for the upstream TLS handshake, on top
    /// of the ambient system trust store.
    #[arg(long = "upstream-ca-file", env = "UPSTREAM_CA_FILE")]
    pub upstream_ca_file: Option<String>,

    /// Upstream TCP connect timeout, milliseconds.
    #[arg(long = "connect-timeout-ms", env = "CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Rolling per-socket read deadline, milliseconds.
    #[arg(long = "read-timeout-ms", env = "READ_TIMEOUT_MS", default_value_t = 120_000)]
    pub read_timeout_ms: u64,

    /// Relay copy buffer size, bytes.
    #[arg(long = "buffer-size", env = "BUFFER_SIZE", default_value_t = 16 * 1024)]
    pub buffer_size: usize,

    /// Maximum bytes accepted for an inbound request head.
    #[arg(long = "header-max-bytes", env = "HEADER_MAX_BYTES", default_value_t = 16 * 1024)]
    pub header_max_bytes: usize,

    /// Maximum bytes read before a non-CONNECT request is considered malformed.
    #[arg(long = "http-max-initial-bytes", env = "HTTP_MAX_INITIAL_BYTES", default_value_t = 64 * 1024)]
    pub http_max_initial_bytes: usize,

    /// Serve a PAC document on the HTTP listener.
    #[arg(long = "pac-enabled", env = "PAC_ENABLED", default_value_t = false)]
    pub pac_enabled: bool,

    /// Path the PAC document is served at.
    #[arg(long = "pac-path", env = "PAC_PATH", default_value = "/proxy.pac")]
    pub pac_path: String,

    /// Host clients should use when the PAC document refers back to this proxy.
    #[arg(long = "pac-host", env = "PAC_HOST")]
    pub pac_host: Option<String>,

    /// Path to a static PAC file to serve; a minimal default is used if unset.
    #[arg(long = "pac-file", env = "PAC_FILE")]
    pub pac_file: Option<String>,

    /// Name used in `Proxy-Authenticate` realm and PAC defaults.
    #[arg(long = "server-name", env = "SERVER_NAME", default_value = "multiproxy")]
    pub server_name: String,

    /// Log level passed through to `env_logger`.
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// File to append JSON-lines access log entries to.
    #[arg(long = "access-log-file", env = "ACCESS_LOG_FILE")]
    pub access_log_file: Option<String>,

    /// Also write access log entries to stdout.
    #[arg(long = "access-log-console", env = "ACCESS_LOG_CONSOLE", default_value_t = false)]
    pub access_log_console: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }
}

/// Fully resolved, immutable configuration consumed by the engine.
///
/// Invariant: if `require_client_auth` is set, `client_auth_expected` is
/// `Some`. `upstream_host` is guaranteed non-empty.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: IpAddr,
    pub http_port: u16,
    pub socks_port: u16,

    pub require_client_auth: bool,
    pub client_auth_expected: Option<String>,

    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_tls: bool,
    pub upstream_auth_header: Option<String>,
    pub upstream_ca_file: Option<String>,

    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub buffer_size: usize,
    pub header_max_bytes: usize,
    pub http_max_initial_bytes: usize,

    pub server_name: String,

    pub pac_enabled: bool,
    pub pac_path: String,
    pub pac_host: Option<String>,
    pub pac_file: Option<String>,

    pub log_level: String,
    pub access_log_file: Option<String>,
    pub access_log_console: bool,
}

pub(crate) fn basic_auth_header(username: &str, password: &str) -> String {
    let token = BASE64.encode(format!("{}:{}", username.trim(), password.trim()));
    format!("Basic {}", token)
}

impl Config {
    /// Resolve a [`Config`] from parsed [`Args`], validating required fields
    /// and pre-encoding any configured credentials.
    pub fn from_args(args: Args) -> Result<Self> {
        if args.upstream_host.trim().is_empty() {
            return Err(Error::ConfigInvalid("upstream.host is required".into()));
        }

        let listen_host = args
            .listen_host
            .parse::<IpAddr>()
            .map_err(|e| Error::ConfigInvalid(format!("invalid listen host: {e}")))?;

        let (require_client_auth, client_auth_expected) =
            match (&args.listen_username, &args.listen_password) {
                (Some(u), Some(p)) if !u.trim().is_empty() => {
                    (true, Some(basic_auth_header(u, p)))
                }
                _ => (false, None),
            };

        let upstream_auth_header = match (&args.upstream_username, &args.upstream_password) {
            (Some(u), Some(p)) if !u.trim().is_empty() => Some(basic_auth_header(u, p)),
            _ => None,
        };

        Ok(Config {
            listen_host,
            http_port: args.http_port,
            socks_port: args.socks_port,
            require_client_auth,
            client_auth_expected,
            upstream_host: args.upstream_host.trim().to_string(),
            upstream_port: args.upstream_port,
            upstream_tls: args.upstream_tls,
            upstream_auth_header,
            upstream_ca_file: args.upstream_ca_file,
            connect_timeout_ms: args.connect_timeout_ms,
            read_timeout_ms: args.read_timeout_ms,
            buffer_size: args.buffer_size,
            header_max_bytes: args.header_max_bytes,
            http_max_initial_bytes: args.http_max_initial_bytes,
            server_name: args.server_name,
            pac_enabled: args.pac_enabled,
            pac_path: args.pac_path,
            pac_host: args.pac_host,
            pac_file: args.pac_file,
            log_level: args.log_level,
            access_log_file: args.access_log_file,
            access_log_console: args.access_log_console,
        })
    }
}
