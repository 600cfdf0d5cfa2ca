use crate::{
    config::{ListenerConfig, SessionConfig},
    SessionFactory, SessionRegistry,
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts inbound connections and starts a session for each.
///
/// Several accept loops share the listening socket so a burst of connections
/// does not queue behind a single accept. Stopping the listener closes the
/// socket but leaves already accepted sessions running; disconnect those
/// through the [`SessionRegistry`].
pub struct Listener {
    /// Dropped on [`stop`](Listener::stop) so the socket closes once the
    /// accept loops exit.
    socket: Option<Arc<TcpListener>>,
    config: ListenerConfig,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    /// Binds to the configured address with the configured backlog. Must be
    /// called from within a Tokio runtime.
    pub async fn bind(config: ListenerConfig) -> io::Result<Self> {
        let socket = if config.address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.address)?;
        let socket = socket.listen(config.backlog)?;
        let local_addr = socket.local_addr()?;
        info!(address = %local_addr, backlog = config.backlog, "Listening");
        Ok(Self {
            socket: Some(Arc::new(socket)),
            config,
            local_addr,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// The bound address, with the actual port if port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loops. Each accepted connection gets a session from
    /// `factory`, an ID from `registry`, and is started immediately.
    pub fn start<F>(&mut self, factory: F, registry: Arc<SessionRegistry>)
    where
        F: SessionFactory,
    {
        let Some(socket) = &self.socket else {
            warn!(address = %self.local_addr, "Listener already stopped");
            return;
        };
        if !self.tasks.is_empty() {
            warn!(address = %self.local_addr, "Listener already started");
            return;
        }
        let acceptor = Arc::new(Acceptor {
            factory: Arc::new(factory),
            registry,
            config: self.config.session.clone(),
            shutdown: self.shutdown.clone(),
        });
        for _ in 0..self.config.accept_tasks.max(1) {
            self.tasks
                .push(tokio::spawn(accept_loop(socket.clone(), acceptor.clone())));
        }
    }

    /// Stops accepting. The socket closes once every accept loop has noticed.
    pub fn stop(&mut self) {
        self.shutdown.cancel();
        self.socket = None;
    }

    /// Waits for the accept loops to exit after [`stop`](Listener::stop).
    pub async fn stopped(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// How long an accept loop pauses after a failed accept. Errors such as
/// EMFILE leave the connection in the backlog, so retrying at once would
/// fail again immediately.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Everything an accept loop needs to turn a connection into a session.
struct Acceptor {
    factory: Arc<dyn SessionFactory>,
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl Acceptor {
    /// Handles one accept outcome. Returns false once the loop should exit.
    async fn handle(&self, accepted: io::Result<(TcpStream, SocketAddr)>) -> bool {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => return self.back_off(&e).await,
        };
        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            warn!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
        }
        let session = self
            .registry
            .open(peer, self.factory.as_ref(), &self.config);
        debug!(session = %session.id(), peer = %peer, "Accepted connection");
        if let Err(e) = session.start(stream) {
            warn!(session = %session.id(), error = %e, "Could not start session");
        }
        true
    }

    /// Logs a failed accept and pauses before the next one. Returns false if
    /// the listener was stopped during the pause.
    async fn back_off(&self, error: &io::Error) -> bool {
        warn!(error = %error, "Accept failed");
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = sleep(ACCEPT_BACKOFF) => true,
        }
    }
}

async fn accept_loop(socket: Arc<TcpListener>, acceptor: Arc<Acceptor>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = acceptor.shutdown.cancelled() => break,
            accepted = socket.accept() => accepted,
        };
        if !acceptor.handle(accepted).await {
            break;
        }
    }
    debug!("Accept loop finished");
}
