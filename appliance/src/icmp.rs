use std::{
    future::Future,
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddrV4},
    sync::OnceLock,
    time::{Duration, Instant},
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::debug;
use wom_common::MonitorConfig;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_HEADER_LEN: usize = 8;
pub const ECHO_PACKET_LEN: usize = ICMP_HEADER_LEN + 8;
const RECV_BUFFER_LEN: usize = 256;

/// Reachability check for one device.
///
/// `Ok(false)` is a clean miss (no reply in time); `Err` is a probe that
/// could not be carried out. Both count as failures for the monitor.
pub trait Prober: Send + Sync {
    fn probe(&self, ip: Ipv4Addr) -> impl Future<Output = io::Result<bool>> + Send;
}

/// One's complement of the one's complement sum of big-endian 16-bit words,
/// odd lengths padded with a zero byte.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRequest {
    pub ident: u16,
    pub seq: u16,
    pub timestamp_us: u64,
}

impl EchoRequest {
    pub fn encode(&self) -> [u8; ECHO_PACKET_LEN] {
        let mut packet = [0u8; ECHO_PACKET_LEN];
        packet[0] = ICMP_ECHO_REQUEST;
        packet[1] = 0;
        packet[4..6].copy_from_slice(&self.ident.to_be_bytes());
        packet[6..8].copy_from_slice(&self.seq.to_be_bytes());
        packet[8..16].copy_from_slice(&self.timestamp_us.to_be_bytes());
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
        packet
    }

    /// Matches a datagram read from a raw IPv4 socket, IP header included.
    pub fn matches_reply(&self, datagram: &[u8]) -> bool {
        let Some(first) = datagram.first() else {
            return false;
        };
        let ip_header_len = usize::from(first & 0x0F) * 4;
        let Some(icmp) = datagram.get(ip_header_len..) else {
            return false;
        };
        if icmp.len() < ICMP_HEADER_LEN {
            return false;
        }

        let ident = u16::from_be_bytes([icmp[4], icmp[5]]);
        let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
        icmp[0] == ICMP_ECHO_REPLY && icmp[1] == 0 && ident == self.ident && seq == self.seq
    }
}

#[derive(Debug, Clone)]
pub struct IcmpProber {
    send_retries: u32,
    send_retry_delay: Duration,
    recv_timeout: Duration,
}

impl IcmpProber {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            send_retries: config.send_retries,
            send_retry_delay: Duration::from_millis(config.send_retry_delay_ms),
            recv_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }

    fn open(ip: Ipv4Addr) -> io::Result<AsyncFd<Socket>> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_nonblocking(true)?;
        socket.connect(&SockAddr::from(SocketAddrV4::new(ip, 0)))?;
        AsyncFd::new(socket)
    }

    async fn send(&self, socket: &AsyncFd<Socket>, packet: &[u8]) -> io::Result<bool> {
        for _ in 0..self.send_retries {
            match (&*socket.get_ref()).write(packet) {
                Ok(size) if size == packet.len() => return Ok(true),
                Ok(size) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short icmp write of {size} bytes"),
                    ))
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory
                    ) =>
                {
                    tokio::time::sleep(self.send_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    async fn await_reply(&self, socket: &AsyncFd<Socket>, request: &EchoRequest) -> io::Result<bool> {
        let mut buffer = [0u8; RECV_BUFFER_LEN];
        let deadline = tokio::time::Instant::now() + self.recv_timeout;

        loop {
            let ready = tokio::time::timeout_at(deadline, socket.readable()).await;
            let Ok(ready) = ready else {
                return Ok(false);
            };
            let mut guard = ready?;

            match guard.try_io(|inner| (&*inner.get_ref()).read(&mut buffer)) {
                Ok(Ok(size)) => {
                    if request.matches_reply(&buffer[..size]) {
                        return Ok(true);
                    }
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }
}

impl Prober for IcmpProber {
    async fn probe(&self, ip: Ipv4Addr) -> io::Result<bool> {
        let socket = Self::open(ip)?;
        let request = EchoRequest {
            ident: rand::random(),
            seq: 1,
            timestamp_us: monotonic_us(),
        };

        if !self.send(&socket, &request.encode()).await? {
            debug!(%ip, "icmp send timed out");
            return Ok(false);
        }

        let replied = self.await_reply(&socket, &request).await?;
        debug!(%ip, replied, "icmp probe finished");
        Ok(replied)
    }
}

fn monotonic_us() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_micros()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_rfc1071_example() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn odd_length_is_zero_padded() {
        assert_eq!(checksum(&[0x12, 0x34, 0x56]), checksum(&[0x12, 0x34, 0x56, 0x00]));
    }

    #[test]
    fn encoded_request_verifies_to_zero() {
        let request = EchoRequest {
            ident: 0xBEEF,
            seq: 1,
            timestamp_us: 123_456_789,
        };
        let packet = request.encode();

        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(&packet[4..8], &[0xBE, 0xEF, 0x00, 0x01]);
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn reply_matching_skips_ip_header_and_checks_identity() {
        let request = EchoRequest {
            ident: 0x1234,
            seq: 1,
            timestamp_us: 0,
        };
        let mut reply = request.encode();
        reply[0] = ICMP_ECHO_REPLY;

        let mut datagram = vec![0x45u8];
        datagram.extend_from_slice(&[0u8; 19]);
        datagram.extend_from_slice(&reply);
        assert!(request.matches_reply(&datagram));

        let other = EchoRequest { ident: 0x4321, ..request };
        assert!(!other.matches_reply(&datagram));

        let mut echoed_request = datagram.clone();
        echoed_request[20] = ICMP_ECHO_REQUEST;
        assert!(!request.matches_reply(&echoed_request));
        assert!(!request.matches_reply(&datagram[..24]));
    }
}
