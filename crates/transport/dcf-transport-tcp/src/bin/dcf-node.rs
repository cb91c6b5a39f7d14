//! 以 TOML 配置启动一个 TCP 节点，直到收到 Ctrl-C。
//!
//! 用法：`dcf-node <config.toml>`；日志级别由 `RUST_LOG` 控制，默认 `info`。

use std::{error::Error, time::Duration};

use dcf_core::{DcfConfig, Session};
use dcf_transport_tcp::TcpConnector;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    install_subscriber()?;

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: dcf-node <config.toml>")?;
    let config = DcfConfig::load(&path)?;
    let connector = TcpConnector::new()
        .with_connect_timeout(Duration::from_millis(config.timeouts.connect_ms))
        .shared();

    let session = Session::builder(config).connector(connector).build()?;
    session.register_handler(|envelope| {
        info!(
            sender = envelope.sender.as_deref().unwrap_or("-"),
            bytes = envelope.payload.len(),
            "message received"
        );
    });

    let mut events = session.subscribe();
    let mode = session.start().await?;
    info!(mode = %mode, node = %session.node_id(), "node running");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => info!(event = ?event, "session event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "session events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.stop().await?;
    info!("node stopped");
    Ok(())
}

fn install_subscriber() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
