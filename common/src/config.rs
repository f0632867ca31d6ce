use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::protocol::SHUTDOWN_PORT;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub token_key: String,
    pub retry_step_secs: u64,
    pub max_retry_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub ready_timeout_secs: u64,
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1/".to_string(),
            token_key: String::new(),
            retry_step_secs: 15,
            max_retry_secs: 60,
            heartbeat_timeout_secs: 180,
            connect_timeout_secs: 15,
            ready_timeout_secs: 30,
            max_message_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub idle_tick_secs: u64,
    pub busy_tick_secs: u64,
    pub busy_count: u32,
    pub retry_times: u32,
    pub probe_timeout_ms: u64,
    pub send_retries: u32,
    pub send_retry_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_tick_secs: 60,
            busy_tick_secs: 15,
            busy_count: 6,
            retry_times: 3,
            probe_timeout_ms: 3_000,
            send_retries: 10,
            send_retry_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub tick_secs: u64,
    pub offset_secs: i64,
    pub action_repeat: u32,
    pub action_interval_ms: u64,
    pub shutdown_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 20,
            offset_secs: 120,
            action_repeat: 3,
            action_interval_ms: 1_000,
            shutdown_port: SHUTDOWN_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub local_ip: Option<[u8; 4]>,
    pub subnet_mask: Option<[u8; 4]>,
    pub broadcast: Option<[u8; 4]>,
}

impl NetworkConfig {
    /// Subnet broadcast when the interface address is known, then the
    /// explicit override, then the limited broadcast address.
    pub fn broadcast_addr(&self) -> Ipv4Addr {
        match (self.local_ip, self.subnet_mask, self.broadcast) {
            (Some(ip), Some(mask), _) => {
                let ip = u32::from(Ipv4Addr::from(ip));
                let mask = u32::from(Ipv4Addr::from(mask));
                Ipv4Addr::from(ip | !mask)
            }
            (_, _, Some(broadcast)) => Ipv4Addr::from(broadcast),
            _ => Ipv4Addr::BROADCAST,
        }
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.local_ip.map(Ipv4Addr::from)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub server: ServerConfig,
    pub monitor: MonitorConfig,
    pub worker: WorkerConfig,
    pub network: NetworkConfig,
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            monitor: MonitorConfig::default(),
            worker: WorkerConfig::default(),
            network: NetworkConfig::default(),
            timezone: "Asia/Shanghai".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        let server = &mut self.server;
        server.retry_step_secs = server.retry_step_secs.clamp(1, 300);
        server.max_retry_secs = server.max_retry_secs.max(server.retry_step_secs);
        server.heartbeat_timeout_secs = server.heartbeat_timeout_secs.clamp(10, 3_600);
        server.connect_timeout_secs = server.connect_timeout_secs.clamp(1, 120);
        server.max_message_bytes = server.max_message_bytes.clamp(1_024, 16 * 1024 * 1024);

        let monitor = &mut self.monitor;
        monitor.idle_tick_secs = monitor.idle_tick_secs.clamp(1, 3_600);
        monitor.busy_tick_secs = monitor.busy_tick_secs.clamp(1, monitor.idle_tick_secs);
        monitor.retry_times = monitor.retry_times.max(1);
        monitor.probe_timeout_ms = monitor.probe_timeout_ms.clamp(100, 30_000);
        monitor.send_retries = monitor.send_retries.max(1);

        let worker = &mut self.worker;
        worker.tick_secs = worker.tick_secs.clamp(1, 60);
        worker.offset_secs = worker.offset_secs.max(0);
        worker.action_repeat = worker.action_repeat.max(1);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn derives_subnet_broadcast_from_interface() {
        let network = NetworkConfig {
            local_ip: Some([192, 168, 1, 23]),
            subnet_mask: Some([255, 255, 255, 0]),
            broadcast: Some([10, 0, 0, 255]),
        };
        assert_eq!(network.broadcast_addr(), Ipv4Addr::new(192, 168, 1, 255));

        let explicit = NetworkConfig {
            broadcast: Some([10, 0, 0, 255]),
            ..NetworkConfig::default()
        };
        assert_eq!(explicit.broadcast_addr(), Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(
            NetworkConfig::default().broadcast_addr(),
            Ipv4Addr::BROADCAST
        );
    }

    #[test]
    fn partial_document_fills_defaults() {
        let mut config: RuntimeConfig = serde_json::from_str(
            r#"{"server":{"url":"wss://wom.example.com/ws","token_key":"k"},"monitor":{"busy_tick_secs":600}}"#,
        )
        .unwrap();
        config.sanitize();

        assert_eq!(config.server.url, "wss://wom.example.com/ws");
        assert_eq!(config.server.max_retry_secs, 60);
        assert_eq!(config.monitor.busy_tick_secs, 60);
        assert_eq!(config.worker.offset_secs, 120);
        assert_eq!(config.timezone, "Asia/Shanghai");
    }
}
