//! Acceptor & Dispatcher (§4.1): two listeners, one per-connection task each,
//! cooperative shutdown via a shared [`CancellationToken`].

use std::sync::Arc;

use log::{info, warn};
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::access_log::AccessLog;
use crate::config::Config;
use crate::error::Result;
use crate::{http_front, socks};

/// Grace period given to in-flight connections after a shutdown signal
/// before remaining tunnels are force-closed.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Binds the HTTP listener, and the SOCKS listener if `config.socks_port`
/// is non-zero, then accepts connections until `shutdown` is cancelled. Once
/// both listeners have stopped accepting, in-flight connection tasks are
/// given `SHUTDOWN_GRACE` to finish on their own before being aborted (§4.1,
/// §5: "closes all in-flight sockets, causing pending reads to error").
pub async fn run(
    config: Arc<Config>,
    tls_connector: Option<Arc<TlsConnector>>,
    access_log: Arc<dyn AccessLog>,
    shutdown: CancellationToken,
) -> Result<()> {
    let http_listener = TcpListener::bind((config.listen_host, config.http_port)).await?;
    info!("HTTP listener bound on {}", http_listener.local_addr()?);

    let socks_listener = if config.socks_port != 0 {
        let listener = TcpListener::bind((config.listen_host, config.socks_port)).await?;
        info!("SOCKS listener bound on {}", listener.local_addr()?);
        Some(listener)
    } else {
        info!("SOCKS listener disabled (socks_port = 0)");
        None
    };

    let http_task = tokio::spawn(accept_loop(
        http_listener,
        config.clone(),
        tls_connector.clone(),
        access_log.clone(),
        shutdown.clone(),
        Protocol::Http,
    ));

    let socks_task = socks_listener.map(|listener| {
        tokio::spawn(accept_loop(
            listener,
            config.clone(),
            tls_connector.clone(),
            access_log.clone(),
            shutdown.clone(),
            Protocol::Socks,
        ))
    });

    let mut http_tunnels = http_task.await.unwrap_or_default();
    let mut socks_tunnels = match socks_task {
        Some(task) => task.await.unwrap_or_default(),
        None => JoinSet::new(),
    };

    info!("listeners stopped, giving in-flight connections {:?} to finish", SHUTDOWN_GRACE);
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    drain_with_deadline(&mut http_tunnels, deadline).await;
    drain_with_deadline(&mut socks_tunnels, deadline).await;
    Ok(())
}

/// Waits for every task in `tunnels` to finish on its own until `deadline`,
/// then aborts whatever is left. Aborting drops each task's owned socket,
/// which is what forces any pending read/write on that connection to error
/// out.
async fn drain_with_deadline(tunnels: &mut JoinSet<()>, deadline: Instant) {
    loop {
        if tunnels.is_empty() {
            return;
        }
        tokio::select! {
            next = tunnels.join_next() => {
                if next.is_none() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!("force-closing {} in-flight connection(s) after shutdown grace period", tunnels.len());
                tunnels.abort_all();
                while tunnels.join_next().await.is_some() {}
                return;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Protocol {
    Http,
    Socks,
}

/// Accepts connections until `shutdown` is cancelled, returning the
/// [`JoinSet`] of per-connection tasks spawned so far so the caller can wait
/// out the shutdown grace period and force-close stragglers.
async fn accept_loop(
    listener: TcpListener,
    config: Arc<Config>,
    tls_connector: Option<Arc<TlsConnector>>,
    access_log: Arc<dyn AccessLog>,
    shutdown: CancellationToken,
    protocol: Protocol,
) -> JoinSet<()> {
    let mut tunnels = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => {
                info!("accept loop shutting down");
                return tunnels;
            }
        };

        let (stream, client_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        if let Err(e) = configure_socket(&stream) {
            warn!("failed to configure accepted socket from {client_addr}: {e}");
        }

        let config = config.clone();
        let tls_connector = tls_connector.clone();
        let access_log = access_log.clone();

        tunnels.spawn(async move {
            match protocol {
                Protocol::Http => {
                    http_front::handle_connection(stream, client_addr, config, tls_connector, access_log).await
                }
                Protocol::Socks => {
                    socks::handle_connection(stream, client_addr, config, tls_connector, access_log).await
                }
            }
        });
    }
}

/// `TCP_NODELAY` via the stream directly; `SO_KEEPALIVE` via `socket2`,
/// the only clean way to reach it from a `tokio::net::TcpStream`.
fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = SockRef::from(stream);
    sock_ref.set_keepalive(true)?;
    Ok(())
}
