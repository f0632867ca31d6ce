use std::{fmt, str::FromStr, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName, RootCertStore},
    TlsConnector,
};

use super::{BoxedTransport, WsError};

const MAX_HEADER_LINES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl FromStr for WsUrl {
    type Err = WsError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let invalid = || WsError::InvalidUrl(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        let secure = match scheme {
            "ws" => false,
            "wss" => true,
            _ => return Err(invalid()),
        };

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, if secure { 443 } else { 80 }),
        };

        if host.is_empty()
            || !host
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
        {
            return Err(invalid());
        }

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

impl fmt::Display for WsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{scheme}://{}:{}{}", self.host, self.port, self.path)
    }
}

pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

pub fn build_request(url: &WsUrl, key: &str, headers: &[(String, String)]) -> String {
    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Origin: {url}\r\n",
        path = url.path,
        host = url.host,
        port = url.port,
    );
    for (name, value) in headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Requires a `101` status line, then consumes header lines up to the blank
/// line that ends the response head.
pub async fn read_response<R>(reader: &mut R) -> Result<(), WsError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(WsError::Handshake("connection closed before status line".into()));
    }

    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let status = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") || status != "101" {
        return Err(WsError::Handshake(format!(
            "unexpected status line `{}`",
            line.trim_end()
        )));
    }

    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(WsError::Handshake("connection closed inside headers".into()));
        }
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            return Ok(());
        }
        if !header.contains(':') {
            return Err(WsError::Handshake(format!("malformed header `{header}`")));
        }
    }

    Err(WsError::Handshake("too many response headers".into()))
}

pub async fn open_transport(url: &WsUrl) -> Result<BoxedTransport, WsError> {
    let tcp = TcpStream::connect((url.host.as_str(), url.port)).await?;
    tcp.set_nodelay(true)?;
    if !url.secure {
        return Ok(Box::new(tcp));
    }

    let server_name =
        ServerName::try_from(url.host.clone()).map_err(|err| WsError::Tls(err.to_string()))?;
    let stream = tls_connector()?.connect(server_name, tcp).await?;
    Ok(Box::new(stream))
}

fn tls_connector() -> Result<TlsConnector, WsError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| WsError::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
