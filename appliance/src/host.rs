use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use anyhow::Context;
use chrono_tz::Tz;
use tokio::sync::RwLock;
use tracing::{info, warn};
use wom_common::{DeviceDirectory, RuntimeConfig};

use crate::{
    channel::Channel,
    icmp::IcmpProber,
    monitor::{Monitor, MonitorHandle},
    power::UdpPowerSwitch,
    server::Server,
    store::ConfigStore,
    worker::Worker,
};

const OUTBOUND_CAPACITY: usize = 4;
const REMOTE_CAPACITY: usize = 8;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::from_env();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |name| std::env::var(name).ok());
    runtime.sanitize();

    let timezone: Tz = runtime
        .timezone
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid timezone `{}`: {err}", runtime.timezone))?;

    let directory = Arc::new(RwLock::new(load_directory(&store).await));
    let outbound = Channel::new(OUTBOUND_CAPACITY);
    let remote = Channel::new(REMOTE_CAPACITY);
    let monitor_handle = MonitorHandle::default();

    let (server, server_handle) = Server::new(
        runtime.server.clone(),
        runtime.network.local_ip(),
        Arc::clone(&directory),
        store,
        outbound.clone(),
        remote.clone(),
    );
    let mut server_task = tokio::spawn(server.run());

    let ready_timeout = Duration::from_secs(runtime.server.ready_timeout_secs);
    if server_handle.ready(ready_timeout).await {
        info!("server ready, starting online");
    } else {
        warn!(
            state = ?server_handle.state(),
            "server not ready after {}s, starting with cached configuration",
            runtime.server.ready_timeout_secs
        );
    }

    let monitor = Monitor::new(
        runtime.monitor.clone(),
        IcmpProber::new(&runtime.monitor),
        Arc::clone(&directory),
        outbound,
        monitor_handle.clone(),
    );
    tokio::spawn(monitor.run());

    let switch = UdpPowerSwitch::new(&runtime.network, &runtime.worker, &runtime.monitor);
    info!(broadcast = %switch.broadcast(), "wake-on-lan target");
    let worker = Arc::new(Worker::new(
        runtime.worker.clone(),
        timezone,
        switch,
        directory,
        monitor_handle.clone(),
    ));

    let scheduled = Arc::clone(&worker);
    tokio::spawn(async move { scheduled.run_schedule().await });
    tokio::spawn(async move { worker.run_remote(remote).await });

    tokio::select! {
        joined = &mut server_task => {
            let result = joined.context("server task aborted")?;
            result.context("server connection manager stopped")
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!(devices = ?monitor_handle.statuses(), "shutting down");
            server_task.abort();
            Ok(())
        }
    }
}

async fn load_directory(store: &ConfigStore) -> DeviceDirectory {
    let mut directory = DeviceDirectory::default();
    match store.load_devices().await {
        Ok(Some(document)) => match directory.apply_json(&document) {
            Ok(()) => info!(devices = directory.len(), "cached configuration loaded"),
            Err(err) => warn!("cached configuration rejected: {err}"),
        },
        Ok(None) => info!("no cached configuration"),
        Err(err) => warn!("failed to load cached configuration: {err:#}"),
    }
    directory
}

fn apply_env_overrides(runtime: &mut RuntimeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("WOM_SERVER_URL") {
        runtime.server.url = url;
    }
    if let Some(key) = var("WOM_TOKEN_KEY") {
        runtime.server.token_key = key;
    }
    if let Some(timezone) = var("WOM_TIMEZONE") {
        runtime.timezone = timezone;
    }
    match var("WOM_LOCAL_IP").map(|raw| raw.parse::<Ipv4Addr>()) {
        Some(Ok(ip)) => runtime.network.local_ip = Some(ip.octets()),
        Some(Err(err)) => warn!("ignoring WOM_LOCAL_IP: {err}"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn env_overrides_replace_stored_values() {
        let env = HashMap::from([
            ("WOM_SERVER_URL", "wss://wom.example.com/ws"),
            ("WOM_TOKEN_KEY", "secret"),
            ("WOM_LOCAL_IP", "192.168.1.23"),
        ]);
        let mut runtime = RuntimeConfig::default();
        apply_env_overrides(&mut runtime, |name| env.get(name).map(|value| value.to_string()));

        assert_eq!(runtime.server.url, "wss://wom.example.com/ws");
        assert_eq!(runtime.server.token_key, "secret");
        assert_eq!(runtime.network.local_ip, Some([192, 168, 1, 23]));
        assert_eq!(runtime.timezone, "Asia/Shanghai");
    }

    #[test]
    fn malformed_local_ip_is_ignored() {
        let mut runtime = RuntimeConfig::default();
        apply_env_overrides(&mut runtime, |name| {
            (name == "WOM_LOCAL_IP").then(|| "not-an-ip".to_string())
        });
        assert_eq!(runtime.network.local_ip, None);
    }

    #[tokio::test]
    async fn invalid_cache_yields_empty_directory() {
        let dir = crate::store::scratch_dir("host-cache");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("devices.json"), br#"{"devices":{}}"#)
            .await
            .unwrap();

        let directory = load_directory(&ConfigStore::new(&dir)).await;
        assert!(directory.is_empty());
        assert_eq!(directory.version(), 0);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
