//! TCP listener and process wiring.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::authority::Authority;
use crate::config::ServerConfig;
use crate::connection;
use crate::event::{ClientHandle, Event};

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    fn build_authority(&self) -> Result<Authority> {
        let policy = self.config.validate()?;
        tracing::info!(
            timeout = ?policy.timeout,
            debounce = ?policy.debounce,
            ban_threshold = policy.ban_threshold,
            identity = ?self.config.identity,
            "Abuse control configured"
        );
        Ok(Authority::new(policy, self.config.welcome.clone()))
    }

    async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to listen on {}", self.config.listen_addr))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let authority = self.build_authority()?;
        let listener = self.bind().await?;
        tracing::info!("Listening on {}", listener.local_addr()?);

        let (events, _authority) = authority.spawn(self.config.event_queue);
        accept_loop(listener, events, self.config).await;
        Ok(())
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let authority = self.build_authority()?;
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let (events, _authority) = authority.spawn(self.config.event_queue);
        let handle = tokio::spawn(accept_loop(listener, events, self.config));
        Ok((addr, handle))
    }
}

/// Accept connections until the authority goes away.
///
/// `Connected` is handed over before the reader starts, so the authority
/// always sees a connection before any of its messages.
async fn accept_loop(listener: TcpListener, events: mpsc::Sender<Event>, config: ServerConfig) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("Accept error: {e}");
                continue;
            }
        };

        let (handle, outbox) = ClientHandle::new(peer, config.identity, config.outbound_queue);
        tracing::debug!(peer = %handle.peer(), address = %handle.address(), conn_id = %handle.id(), "Accepted connection");

        if events.send(Event::Connected(handle.clone())).await.is_err() {
            tracing::error!("Authority stopped, no longer accepting");
            return;
        }

        tokio::spawn(connection::serve(
            stream,
            handle,
            outbox,
            events.clone(),
            config.read_buffer,
        ));
    }
}
