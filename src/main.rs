use std::sync::Arc;

use log::error;
use tokio_util::sync::CancellationToken;

use multiproxy::access_log::{AccessLog, QueuedAccessLog};
use multiproxy::config::{Args, Config};

#[tokio::main]
async fn main() {
    let args = Args::parse_args();

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();

    let access_log: Arc<dyn AccessLog> =
        Arc::new(QueuedAccessLog::spawn(config.access_log_file.clone(), config.access_log_console));

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_signal.cancel();
        }
    });

    if let Err(e) = multiproxy::run(config, access_log, shutdown).await {
        error!("multiproxy exited with error: {e}");
        std::process::exit(1);
    }
}
