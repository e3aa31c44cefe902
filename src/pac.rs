//! PAC (Proxy Auto-Config) document serving (§6).
//!
//! Formatting the document itself is the "external collaborator" concern
//! `spec.md` carves out — this module only knows how to read a configured
//! static file or fall back to a minimal generated document that points
//! every request at this proxy.

use tokio::fs;

use crate::config::Config;

pub const CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig; charset=utf-8";

/// Returns the PAC document body: the configured `pac.file` contents if set
/// and readable, otherwise a minimal generated document naming
/// `pac.host`/`http_port` (falling back to `listen_host`).
pub async fn document(config: &Config) -> String {
    if let Some(path) = &config.pac_file {
        if let Ok(contents) = fs::read_to_string(path).await {
            return contents;
        }
    }
    default_document(config)
}

fn default_document(config: &Config) -> String {
    let host = config
        .pac_host
        .clone()
        .unwrap_or_else(|| config.listen_host.to_string());
    format!(
        "function FindProxyForURL(url, host) {{\n    return \"PROXY {host}:{port}\";\n}}\n",
        host = host,
        port = config.http_port
    )
}
