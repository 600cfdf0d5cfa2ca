use crate::{
    config::ConnectorConfig,
    session::StartError,
    Session, SessionFactory, SessionRegistry,
};
use futures::future::join_all;
use std::{io, net::SocketAddr, sync::Arc};
use thiserror::Error as ThisError;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Opens outbound connections and starts a session for each.
///
/// Every attempt is independent: one failing does not affect the others, and
/// nothing is retried. Retry policy belongs to the caller.
pub struct Connector {
    registry: Arc<SessionRegistry>,
    config: ConnectorConfig,
}

impl Connector {
    pub fn new(registry: Arc<SessionRegistry>, config: ConnectorConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Makes `count` concurrent connection attempts to `address`, returning
    /// the outcome of each in attempt order.
    pub async fn connect<F>(
        &self,
        address: SocketAddr,
        factory: &F,
        count: usize,
    ) -> Vec<Result<Arc<Session>, ConnectError>>
    where
        F: SessionFactory + ?Sized,
    {
        join_all((0..count).map(|attempt| self.attempt(address, factory, attempt))).await
    }

    /// Makes a single connection attempt.
    pub async fn connect_one<F>(
        &self,
        address: SocketAddr,
        factory: &F,
    ) -> Result<Arc<Session>, ConnectError>
    where
        F: SessionFactory + ?Sized,
    {
        self.attempt(address, factory, 0).await
    }

    async fn attempt<F>(
        &self,
        address: SocketAddr,
        factory: &F,
        attempt: usize,
    ) -> Result<Arc<Session>, ConnectError>
    where
        F: SessionFactory + ?Sized,
    {
        let stream = TcpStream::connect(address).await.map_err(|source| {
            warn!(attempt, address = %address, error = %source, "Connect failed");
            ConnectError::Connect {
                attempt,
                address,
                source,
            }
        })?;
        if let Err(e) = stream.set_nodelay(self.config.session.nodelay) {
            warn!(address = %address, error = %e, "Could not set TCP_NODELAY");
        }
        let peer = stream.peer_addr().unwrap_or(address);
        let session = self.registry.open(peer, factory, &self.config.session);
        debug!(session = %session.id(), attempt, peer = %peer, "Connected");
        session
            .start(stream)
            .map_err(|source| ConnectError::Start { attempt, source })?;
        Ok(session)
    }
}

#[derive(Debug, ThisError)]
pub enum ConnectError {
    #[error("Attempt {attempt} to connect to {address} failed: {source}")]
    Connect {
        attempt: usize,
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Attempt {attempt} connected but the session could not start: {source}")]
    Start {
        attempt: usize,
        #[source]
        source: StartError,
    },
}

impl ConnectError {
    /// The index of the failed attempt within its batch.
    pub fn attempt(&self) -> usize {
        match self {
            Self::Connect { attempt, .. } | Self::Start { attempt, .. } => *attempt,
        }
    }

    /// The OS error kind, for failures to establish the connection.
    pub fn kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Connect { source, .. } => Some(source.kind()),
            Self::Start { .. } => None,
        }
    }
}
