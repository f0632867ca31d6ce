use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use tokio::net::UdpSocket;
use tracing::debug;
use wom_common::{
    Device, MacAddr, MonitorConfig, NetworkConfig, WorkerConfig, SHUTDOWN_MAGIC, WOL_PORT,
};

pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

/// Wake-on-LAN and shutdown signalling for one device. Each call owns its
/// socket for its whole duration.
pub trait PowerSwitch: Send + Sync {
    fn wake(&self, device: &Device) -> impl Future<Output = io::Result<()>> + Send;
    fn shutdown(&self, device: &Device) -> impl Future<Output = io::Result<()>> + Send;
}

pub fn magic_packet(mac: MacAddr) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xFF; MAGIC_PACKET_LEN];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac.octets());
    }
    packet
}

#[derive(Debug, Clone)]
pub struct UdpPowerSwitch {
    broadcast: Ipv4Addr,
    shutdown_port: u16,
    send_retries: u32,
    send_retry_delay: Duration,
}

impl UdpPowerSwitch {
    pub fn new(network: &NetworkConfig, worker: &WorkerConfig, monitor: &MonitorConfig) -> Self {
        Self {
            broadcast: network.broadcast_addr(),
            shutdown_port: worker.shutdown_port,
            send_retries: monitor.send_retries.max(1),
            send_retry_delay: Duration::from_millis(monitor.send_retry_delay_ms),
        }
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.broadcast
    }

    async fn send(&self, target: SocketAddrV4, payload: &[u8], broadcast: bool) -> io::Result<()> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        if broadcast {
            socket.set_broadcast(true)?;
        }

        let mut attempt = 0;
        loop {
            match socket.send_to(payload, target).await {
                Ok(_) => return Ok(()),
                Err(err) if is_busy(&err) && attempt + 1 < self.send_retries => {
                    attempt += 1;
                    debug!(%target, attempt, "datagram send busy, retrying");
                    tokio::time::sleep(self.send_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_busy(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory
    )
}

impl PowerSwitch for UdpPowerSwitch {
    async fn wake(&self, device: &Device) -> io::Result<()> {
        let target = SocketAddrV4::new(self.broadcast, WOL_PORT);
        self.send(target, &magic_packet(device.mac), true).await
    }

    async fn shutdown(&self, device: &Device) -> io::Result<()> {
        let target = SocketAddrV4::new(device.ip, self.shutdown_port);
        self.send(target, SHUTDOWN_MAGIC, false).await
    }
}

#[cfg(test)]
mod tests {
    use wom_common::DeviceSchedule;

    use super::*;

    fn device(ip: Ipv4Addr) -> Device {
        Device {
            name: "A".to_string(),
            ip,
            mac: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            schedule: DeviceSchedule::default(),
        }
    }

    #[test]
    fn magic_packet_layout() {
        let packet = magic_packet("AA:BB:CC:DD:EE:FF".parse().unwrap());
        assert_eq!(packet.len(), 102);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        for chunk in packet[6..].chunks(6) {
            assert_eq!(chunk, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        }
    }

    #[tokio::test]
    async fn shutdown_datagram_reaches_device_port() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let worker = WorkerConfig {
            shutdown_port: port,
            ..WorkerConfig::default()
        };
        let switch = UdpPowerSwitch::new(&NetworkConfig::default(), &worker, &MonitorConfig::default());
        switch.shutdown(&device(Ipv4Addr::LOCALHOST)).await.unwrap();

        let mut buffer = [0u8; 64];
        let (size, _) = listener.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..size], SHUTDOWN_MAGIC);
    }

    #[test]
    fn broadcast_follows_network_config() {
        let network = NetworkConfig {
            local_ip: Some([10, 0, 0, 7]),
            subnet_mask: Some([255, 255, 255, 0]),
            broadcast: None,
        };
        let switch = UdpPowerSwitch::new(&network, &WorkerConfig::default(), &MonitorConfig::default());
        assert_eq!(switch.broadcast(), Ipv4Addr::new(10, 0, 0, 255));
    }
}
