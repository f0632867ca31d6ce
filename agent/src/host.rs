use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    process::Command,
};

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use wom_common::{SHUTDOWN_MAGIC, SHUTDOWN_PORT};

const MAX_DATAGRAM: usize = 1500;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port = std::env::var("WOM_AGENT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(SHUTDOWN_PORT);
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("failed to bind udp port {port}"))?;
    info!(port, "shutdown agent listening");

    loop {
        tokio::select! {
            request = wait_for_shutdown(&socket) => {
                let from = request.context("shutdown listener failed")?;
                info!(%from, "shutdown requested");
                if let Err(err) = shutdown_command().spawn() {
                    warn!("failed to start shutdown command: {err}");
                }
            }
            _ = stop_signal() => {
                info!("stop signal received");
                return Ok(());
            }
        }
    }
}

/// Resolves with the sender of the first datagram carrying the shutdown
/// magic. Anything else is logged and skipped.
async fn wait_for_shutdown(socket: &UdpSocket) -> io::Result<SocketAddr> {
    let mut buffer = [0u8; MAX_DATAGRAM];
    loop {
        let (size, from) = socket.recv_from(&mut buffer).await?;
        let payload = &buffer[..size];
        if payload == SHUTDOWN_MAGIC {
            return Ok(from);
        }
        info!(%from, "unknown packet {}", String::from_utf8_lossy(payload));
    }
}

fn shutdown_command() -> Command {
    let mut command = Command::new("shutdown");
    if cfg!(windows) {
        command.args(["/s", "/t", "5"]);
    } else {
        command.args(["-h", "now"]);
    }
    command
}

#[cfg(unix)]
async fn stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = terminate.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
