/*!
 * # Multiproxy
 *
 * A local proxy front-end exposing HTTP forward proxy (with CONNECT
 * tunnelling), SOCKS4/4a, and SOCKS5, all forwarding transparently through a
 * single configured upstream HTTP(S) proxy.
 *
 * ## Modules
 *
 * - `config`: command-line/env configuration and validation
 * - `error`: shared error type for every protocol state machine
 * - `tunnel`: per-connection state and access-log events
 * - `access_log`: pluggable sink for completed-tunnel events
 * - `request`: inbound HTTP request-head parsing
 * - `pac`: PAC document serving
 * - `upstream`: upstream dialer and HTTP-CONNECT bridge
 * - `relay`: bidirectional byte relay
 * - `http_front`: HTTP forward-proxy and CONNECT handling
 * - `socks`: unified SOCKS4/4a and SOCKS5 state machine
 * - `acceptor`: listener accept loops and per-connection dispatch
 */

pub mod access_log;
pub mod acceptor;
pub mod config;
pub mod error;
pub mod http_front;
pub mod pac;
pub mod relay;
pub mod request;
pub mod socks;
pub mod tunnel;
pub mod upstream;

use std::sync::Arc;

use log::info;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::access_log::AccessLog;
use crate::config::Config;
use crate::error::Result;
use crate::upstream::build_tls_connector;

/// Runs the proxy engine until `shutdown` is cancelled (normally on
/// `ctrl_c`, wired up by the binary entry point).
pub async fn run(config: Config, access_log: Arc<dyn AccessLog>, shutdown: CancellationToken) -> Result<()> {
    info!(
        "starting multiproxy: http={}:{} socks={}:{} upstream={}:{} tls={}",
        config.listen_host,
        config.http_port,
        config.listen_host,
        config.socks_port,
        config.upstream_host,
        config.upstream_port,
        config.upstream_tls,
    );

    let tls_connector: Option<Arc<TlsConnector>> = if config.upstream_tls {
        Some(Arc::new(build_tls_connector(config.upstream_ca_file.as_deref())?))
    } else {
        None
    };

    let config = Arc::new(config);
    acceptor::run(config, tls_connector, access_log, shutdown).await
}
