use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{watch, RwLock},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use wom_common::{
    DeviceDirectory, Inbound, Outbound, Remote, ServerConfig, HEADER_IP, HEADER_TOKEN,
};

use crate::{
    channel::Channel,
    error::{ErrorKind, ErrorLatch, WomError},
    store::ConfigStore,
    websocket::{
        BoxedTransport, Message, WebSocketClient, WsReceiver, WsSender, CLOSE_GOING_AWAY,
        CLOSE_PROTOCOL_ERROR,
    },
};

pub type SharedDirectory = Arc<RwLock<DeviceDirectory>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, no configuration accepted yet on this connection.
    Connected,
    Ready,
}

/// `"<now>|base64(sha256("<now>|<key>"))"`
pub fn sign_token(now: i64, key: &str) -> String {
    let digest = Sha256::digest(format!("{now}|{key}").as_bytes());
    format!("{now}|{}", STANDARD.encode(digest))
}

/// Reconnect delay growing by a fixed step up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    max: Duration,
    last: Duration,
}

impl Backoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max,
            last: Duration::ZERO,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.last = (self.last + self.step).min(self.max);
        self.last
    }
}

#[derive(Clone)]
pub struct ServerHandle {
    state: watch::Receiver<ConnectionState>,
}

impl ServerHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the first configuration push of a connection has been
    /// applied. `false` on timeout.
    pub async fn ready(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let wait = state.wait_for(|state| *state == ConnectionState::Ready);
        let ready = matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)));
        ready
    }
}

pub struct Server {
    config: ServerConfig,
    local_ip: Option<Ipv4Addr>,
    directory: SharedDirectory,
    store: ConfigStore,
    outbound: Channel<Outbound>,
    remote: Channel<Remote>,
    state: watch::Sender<ConnectionState>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        local_ip: Option<Ipv4Addr>,
        directory: SharedDirectory,
        store: ConfigStore,
        outbound: Channel<Outbound>,
        remote: Channel<Remote>,
    ) -> (Self, ServerHandle) {
        let (state, receiver) = watch::channel(ConnectionState::Disconnected);
        let server = Self {
            config,
            local_ip,
            directory,
            store,
            outbound,
            remote,
            state,
        };
        (server, ServerHandle { state: receiver })
    }

    /// Connects, serves until the link drops, and reconnects. Returns only
    /// on a fatal error.
    pub async fn run(self) -> Result<(), WomError> {
        let mut latch = ErrorLatch::default();
        loop {
            let client = self.connect(&mut latch).await?;
            let result = self.serve(client).await;
            self.set_state(ConnectionState::Disconnected);

            match result {
                Ok(()) => info!("server connection closed"),
                Err(err) if err.kind().is_recoverable() => {
                    warn!("server connection dropped: {err}");
                }
                Err(err) => {
                    error!("server connection failed: {err}");
                    return Err(err);
                }
            }
        }
    }

    fn headers(&self, now: i64) -> Vec<(String, String)> {
        let mut headers = vec![(
            HEADER_TOKEN.to_string(),
            sign_token(now, &self.config.token_key),
        )];
        if let Some(ip) = self.local_ip {
            headers.push((HEADER_IP.to_string(), ip.to_string()));
        }
        headers
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "server state changed");
        }
    }

    async fn connect(
        &self,
        latch: &mut ErrorLatch,
    ) -> Result<WebSocketClient<BoxedTransport>, WomError> {
        let mut backoff = Backoff::new(
            Duration::from_secs(self.config.retry_step_secs),
            Duration::from_secs(self.config.max_retry_secs),
        );
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);

        loop {
            self.set_state(ConnectionState::Connecting);
            let headers = self.headers(Utc::now().timestamp());
            let attempt = tokio::time::timeout(
                connect_timeout,
                WebSocketClient::connect(
                    &self.config.url,
                    &headers,
                    self.config.max_message_bytes,
                ),
            )
            .await;

            let err = match attempt {
                Ok(Ok(client)) => {
                    latch.reset();
                    info!(url = %self.config.url, "server connected");
                    self.set_state(ConnectionState::Connected);
                    return Ok(client);
                }
                Ok(Err(err)) => WomError::from(err),
                Err(_) => WomError::ConnectTimeout(self.config.connect_timeout_secs),
            };
            self.set_state(ConnectionState::Disconnected);

            if !err.kind().is_recoverable() {
                error!(url = %self.config.url, "server connect failed: {err}");
                return Err(err);
            }
            if latch.should_log(&err.to_string()) {
                warn!(url = %self.config.url, "server connect failed: {err}");
            }

            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Runs the inbound and outbound loops over one connection until either
    /// ends, then closes the socket.
    pub async fn serve<S>(&self, client: WebSocketClient<S>) -> Result<(), WomError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (sender, mut receiver) = client.split();

        let result = tokio::select! {
            result = self.inbound(&mut receiver) => result,
            result = self.outbound(&sender) => result,
        };

        let code = match &result {
            Err(err) if err.kind() == ErrorKind::Protocol => CLOSE_PROTOCOL_ERROR,
            _ => CLOSE_GOING_AWAY,
        };
        if let Err(err) = sender.close(code, "").await {
            debug!("server close failed: {err}");
        }
        result
    }

    async fn inbound<S>(&self, receiver: &mut WsReceiver<S>) -> Result<(), WomError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);
        let mut last_heartbeat = Instant::now();

        loop {
            let received = tokio::time::timeout_at(last_heartbeat + timeout, receiver.receive()).await;
            let message = match received {
                Err(_) => return Err(WomError::HeartbeatLost(self.config.heartbeat_timeout_secs)),
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(err)) => return Err(err.into()),
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Binary(bytes) => {
                    debug!(len = bytes.len(), "binary frame ignored");
                    continue;
                }
            };

            match serde_json::from_str::<Inbound>(&text) {
                Ok(inbound) => {
                    if self.dispatch(inbound).await {
                        last_heartbeat = Instant::now();
                    }
                }
                Err(err) => warn!("{}", WomError::BadMessage(err)),
            }
        }
    }

    /// Handles one inbound message; `true` when it counts as liveness.
    async fn dispatch(&self, inbound: Inbound) -> bool {
        if !matches!(inbound, Inbound::Flush) {
            debug!(kind = inbound.kind(), "server message");
        }

        match inbound {
            Inbound::Config(document) => {
                self.apply_config(&document).await;
                true
            }
            Inbound::Heartbeat => true,
            Inbound::Flush => false,
            command @ (Inbound::Wakeup(_) | Inbound::Shutdown(_)) => {
                if let Some(remote) = command.into_remote() {
                    if self.remote.send(remote).is_some() {
                        warn!("remote command queue full, oldest command dropped");
                    }
                }
                false
            }
        }
    }

    async fn apply_config(&self, document: &serde_json::Value) {
        let applied = {
            let mut directory = self.directory.write().await;
            directory
                .apply_json(document)
                .map(|()| (directory.version(), directory.len()))
        };

        match applied {
            Ok((version, devices)) => {
                info!(version, devices, "configuration applied");
                if let Err(err) = self.store.save_devices(document).await {
                    warn!("failed to cache configuration: {err:#}");
                }
                self.set_state(ConnectionState::Ready);
            }
            Err(err) => warn!("configuration rejected: {}", WomError::from(err)),
        }
    }

    async fn outbound<S>(&self, sender: &WsSender<S>) -> Result<(), WomError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let message = self.outbound.recv().await;
            let text = serde_json::to_string(&message)?;
            debug!(%text, "server send");
            sender.send_text(&text).await?;
        }
    }
}
