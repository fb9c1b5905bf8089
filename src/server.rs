//! TCP server and connection registry.
//!
//! The server tracks every live listener and connection so that
//! [`Server::shutdown`] can stop accepting, wait for the accept loops to
//! exit, then drain connections as they go idle.
//!
//! Shutdown ordering:
//! 1. the shutdown flag is set (new listeners are refused from here on)
//! 2. every registered listener is closed
//! 3. all accept loops have exited
//! 4. idle connections are closed on a backoff until none remain or the
//!    caller's deadline fires

use crate::error::ServerError;
use crate::handler::Handler;
use crate::runtime::{
    unix_now, ConnHandle, ConnId, ConnState, Connection, ConnectionRegistry, DrainPolicy,
};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Listen backlog
const LISTEN_BACKLOG: i32 = 1024;

/// A registered listener, closed through its token by `shutdown`.
struct ListenerEntry {
    local_addr: SocketAddr,
    close: CancellationToken,
}

/// Live listeners and connections, guarded together by the registry lock.
struct Tracked {
    listeners: HashMap<ConnId, ListenerEntry>,
    connections: ConnectionRegistry,
}

/// State shared between the server handle, accept loops and connections.
pub(crate) struct Shared<H> {
    handler: Arc<H>,
    policy: DrainPolicy,
    in_shutdown: AtomicBool,
    shutdown_started: CancellationToken,
    grace_period_ms: AtomicU64,
    next_id: AtomicU64,
    tracked: Mutex<Tracked>,
    listener_group: TaskTracker,
}

impl<H> Shared<H> {
    pub(crate) fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    /// Completes once shutdown has begun.
    pub(crate) fn shutdown_started(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown_started.cancelled()
    }

    pub(crate) fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms.load(Ordering::Acquire))
    }

    pub(crate) fn next_id(&self) -> ConnId {
        ConnId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn track_conn(&self, conn: &Arc<ConnHandle>, add: bool) {
        let mut tracked = self.tracked.lock().expect("registry lock poisoned");
        if add {
            tracked.connections.insert(conn);
        } else {
            tracked.connections.remove(conn.id());
        }
    }

    /// Register a listener unless shutdown has begun. The returned tracker
    /// token keeps `shutdown` waiting until the accept loop drops it.
    fn track_listener(
        &self,
        local_addr: SocketAddr,
    ) -> Result<(ConnId, CancellationToken, TaskTrackerToken), ServerError> {
        let mut tracked = self.tracked.lock().expect("registry lock poisoned");
        if self.is_shutting_down() {
            return Err(ServerError::ServerClosed);
        }

        let id = self.next_id();
        let close = CancellationToken::new();
        tracked.listeners.insert(
            id,
            ListenerEntry {
                local_addr,
                close: close.clone(),
            },
        );
        Ok((id, close, self.listener_group.token()))
    }

    fn untrack_listener(&self, id: ConnId) {
        let mut tracked = self.tracked.lock().expect("registry lock poisoned");
        if let Some(listener) = tracked.listeners.remove(&id) {
            debug!(address = %listener.local_addr, "Listener stopped");
        }
    }

    /// Close every registered listener, returning how many there were.
    fn close_listeners(&self) -> usize {
        let tracked = self.tracked.lock().expect("registry lock poisoned");
        for listener in tracked.listeners.values() {
            listener.close.cancel();
        }
        tracked.listeners.len()
    }

    /// Close every closable connection; `true` once none remain.
    fn close_idle_conns(&self) -> bool {
        let mut tracked = self.tracked.lock().expect("registry lock poisoned");
        tracked.connections.close_idle(&self.policy, unix_now())
    }

    fn active_connections(&self) -> usize {
        self.tracked
            .lock()
            .expect("registry lock poisoned")
            .connections
            .len()
    }
}

/// Transaction server handle.
///
/// Cloning yields another handle to the same server, so one task can run
/// [`start`](Server::start) while another calls [`shutdown`](Server::shutdown).
pub struct Server<H: Handler> {
    shared: Arc<Shared<H>>,
}

impl<H: Handler> Clone for Server<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: Handler> Server<H> {
    /// Create a server with the default drain policy
    pub fn new(handler: H) -> Self {
        Self::with_policy(handler, DrainPolicy::default())
    }

    /// Create a server with a custom drain policy
    pub fn with_policy(handler: H, policy: DrainPolicy) -> Self {
        Server {
            shared: Arc::new(Shared {
                handler: Arc::new(handler),
                policy,
                in_shutdown: AtomicBool::new(false),
                shutdown_started: CancellationToken::new(),
                grace_period_ms: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                tracked: Mutex::new(Tracked {
                    listeners: HashMap::new(),
                    connections: ConnectionRegistry::new(),
                }),
                listener_group: TaskTracker::new(),
            }),
        }
    }

    /// Bind `addr`, then accept connections until the listener is closed.
    ///
    /// Returns [`ServerError::ServerClosed`] once shutdown closes the
    /// listener, which callers should treat as a clean exit.
    pub async fn start(&self, addr: &str, grace_period: Duration) -> Result<(), ServerError> {
        let listener = self.bind(addr).await?;
        self.serve(listener, grace_period).await
    }

    /// Bind a listening socket without accepting on it yet.
    pub async fn bind(&self, addr: &str) -> Result<TcpListener, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };

        let socket_addr = tokio::net::lookup_host(addr)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "address resolved to nothing",
                ))
            })?;

        let listener = create_listener(socket_addr).map_err(bind_err)?;
        TcpListener::from_std(listener).map_err(bind_err)
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        grace_period: Duration,
    ) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        let (id, close, _running) = self.shared.track_listener(local_addr)?;
        self.shared
            .grace_period_ms
            .store(grace_period.as_millis() as u64, Ordering::Release);
        info!(address = %local_addr, grace_period_ms = grace_period.as_millis() as u64, "Server listening");

        let result = self.accept_loop(listener, close).await;

        self.shared.untrack_listener(id);
        result
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        close: CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = close.cancelled() => return Err(ServerError::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    let conn = Connection::new(Arc::clone(&self.shared), stream, peer);
                    conn.set_state(ConnState::New);
                    tokio::spawn(conn.run());
                }
                Err(e) if self.shared.is_shutting_down() => {
                    debug!(error = %e, "Accept failed during shutdown");
                    return Err(ServerError::ServerClosed);
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Stop accepting, then drain connections until none remain or
    /// `deadline` completes.
    ///
    /// `deadline` bounds only the wait: connections still open when it fires
    /// are left to the caller. Pass `std::future::pending()` to wait
    /// indefinitely.
    pub async fn shutdown<F>(&self, deadline: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let shared = &self.shared;
        shared.in_shutdown.store(true, Ordering::Release);
        shared.shutdown_started.cancel();

        let listeners = shared.close_listeners();
        shared.listener_group.close();
        shared.listener_group.wait().await;
        info!(
            listeners,
            connections = shared.active_connections(),
            "Listeners closed, draining connections"
        );

        tokio::pin!(deadline);
        let mut backoff = shared.policy.backoff();
        loop {
            if shared.close_idle_conns() {
                info!("All connections drained");
                return Ok(());
            }

            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        remaining = shared.active_connections(),
                        "Shutdown deadline exceeded"
                    );
                    return Err(ServerError::DeadlineExceeded);
                }
                _ = tokio::time::sleep(backoff.next_interval()) => {}
            }
        }
    }

    /// Number of connections currently tracked as live
    pub fn active_connections(&self) -> usize {
        self.shared.active_connections()
    }
}

/// Create a non-blocking listening socket with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
