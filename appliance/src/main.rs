mod channel;
mod error;
mod host;
mod icmp;
mod monitor;
mod power;
mod server;
mod store;
mod websocket;
mod worker;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
