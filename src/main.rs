use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use irc_idler::config::ServerConfig;
use irc_idler::proxy::{Control, Proxy, TcpDialer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let listen = std::env::var("IDLER_LISTEN").unwrap_or_else(|_| "127.0.0.1:6667".into());
    let backlog = std::env::var("IDLER_BACKLOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let listener = TcpListener::bind(&listen).await?;
    info!("irc-idler listening on {listen}");

    let (conn_tx, conn_rx) = mpsc::channel(1);
    let (control_tx, control_rx) = mpsc::channel(8);

    // Feed accepted client connections to the controller; it enforces
    // the one-client policy.
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    info!(%addr, "client connection");
                    if conn_tx.send(socket).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("accept error: {e}"),
            }
        }
    });

    // Ctrl-C shuts the proxy down cleanly.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = control_tx.send(Control::Shutdown).await;
        }
    });

    Proxy::new(config, TcpDialer, conn_rx, control_rx, backlog)
        .run()
        .await;

    Ok(())
}
