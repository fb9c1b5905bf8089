//! Connection lifecycle for accepted TCP streams.
//!
//! Each accepted stream is owned by exactly one [`Connection`], which runs on
//! its own task. Everything other tasks need to see (the packed state and the
//! close signal) lives in a shared [`ConnHandle`] tracked by the
//! [`ConnectionRegistry`].

use crate::handler::Handler;
use crate::protocol::{self, LineResult, Response};
use crate::runtime::{ConnState, DrainPolicy, StateCell};
use crate::server::Shared;
use bytes::BytesMut;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Identity of a tracked connection or listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The part of a connection visible to the registry and the drain loop.
#[derive(Debug)]
pub struct ConnHandle {
    id: ConnId,
    peer: SocketAddr,
    state: StateCell,
    closing: CancellationToken,
}

impl ConnHandle {
    pub fn new(id: ConnId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: StateCell::new(),
            closing: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Ask the owning task to close the stream at its next read.
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }
}

/// Identity-keyed set of live connections.
///
/// Not synchronized itself; the server keeps it behind its registry lock.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnId, Arc<ConnHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection. Re-inserting a tracked connection is a no-op.
    pub fn insert(&mut self, conn: &Arc<ConnHandle>) {
        self.connections
            .entry(conn.id)
            .or_insert_with(|| Arc::clone(conn));
    }

    /// Stop tracking a connection.
    pub fn remove(&mut self, id: ConnId) -> Option<Arc<ConnHandle>> {
        self.connections.remove(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and untrack every closable connection.
    ///
    /// Returns `true` when nothing is left to wait for.
    pub fn close_idle(&mut self, policy: &DrainPolicy, now: u64) -> bool {
        self.connections.retain(|_, conn| {
            let (state, unix_sec) = conn.state.load();
            if !policy.is_closable(state, unix_sec, now) {
                return true;
            }
            debug!(conn = %conn.id, peer = %conn.peer, ?state, "Closing idle connection");
            conn.close();
            false
        });
        self.is_empty()
    }
}

/// A single accepted client connection.
pub struct Connection<H: Handler> {
    shared: Arc<Shared<H>>,
    handle: Arc<ConnHandle>,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<H: Handler> Connection<H> {
    pub(crate) fn new(shared: Arc<Shared<H>>, stream: TcpStream, peer: SocketAddr) -> Self {
        let handle = Arc::new(ConnHandle::new(shared.next_id(), peer));
        Self {
            shared,
            handle,
            stream,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(64),
        }
    }

    /// Transition to `state`, registering on `New` and unregistering on
    /// `Closed`.
    pub fn set_state(&self, state: ConnState) {
        match state {
            ConnState::New => self.shared.track_conn(&self.handle, true),
            ConnState::Closed => self.shared.track_conn(&self.handle, false),
            ConnState::Idle => {}
        }
        self.handle.state.store(state);
    }

    /// Serve requests until the peer hangs up, a read fails, or the drain loop
    /// closes this connection. Always ends in `Closed`.
    pub async fn run(mut self) {
        if let Err(e) = self.serve().await {
            warn!(conn = %self.handle.id, peer = %self.handle.peer, error = %e, "Connection error");
        }
        // Dropping `self` transitions to Closed and releases the stream.
    }

    async fn serve(&mut self) -> io::Result<()> {
        let mut responded = false;

        loop {
            if self.handle.is_closing() {
                debug!(conn = %self.handle.id, "Connection closed by drain");
                return Ok(());
            }

            match protocol::take_line(&mut self.read_buf) {
                LineResult::Complete(line) => {
                    if !self.process_unless_closed(line).await? {
                        debug!(conn = %self.handle.id, "Connection closed by drain mid-request");
                        return Ok(());
                    }
                    responded = true;
                    continue;
                }
                LineResult::TooLong => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "request line too long",
                    ));
                }
                LineResult::Incomplete => {}
            }

            if responded {
                self.set_state(ConnState::Idle);
                responded = false;
            }

            let n = tokio::select! {
                biased;
                _ = self.handle.closing.cancelled() => continue,
                read = self.stream.read_buf(&mut self.read_buf) => read?,
            };

            if n == 0 {
                if let Some(line) = protocol::take_remainder(&mut self.read_buf) {
                    self.process_unless_closed(line).await?;
                }
                trace!(conn = %self.handle.id, "Connection closed by client");
                return Ok(());
            }
        }
    }

    /// Process one request unless the drain loop closes this connection
    /// first. Returns `false` if the request was abandoned.
    async fn process_unless_closed(&mut self, line: String) -> io::Result<bool> {
        let handle = Arc::clone(&self.handle);
        tokio::select! {
            biased;
            _ = handle.closing.cancelled() => Ok(false),
            processed = self.process(line) => processed.map(|()| true),
        }
    }

    async fn process(&mut self, line: String) -> io::Result<()> {
        self.set_state(ConnState::New);
        trace!(conn = %self.handle.id, request = %line, "Processing request");

        let response = self.dispatch(line).await;
        trace!(conn = %self.handle.id, rejected = response.is_rejected(), %response, "Responding");

        self.write_buf.clear();
        response.encode(&mut self.write_buf);
        self.stream.write_all(&self.write_buf).await
    }

    /// Run the handler, time-boxed by the grace period once shutdown begins.
    ///
    /// Before shutdown the handler runs inline; if shutdown starts while it is
    /// still running it gets one grace period from that moment. During
    /// shutdown the handler runs on its own task, which is abandoned, not
    /// aborted, if the grace period elapses first.
    async fn dispatch(&self, request: String) -> Response {
        if self.shared.is_shutting_down() {
            return self.dispatch_detached(request).await;
        }

        let handled = self.shared.handler().handle(request);
        tokio::pin!(handled);

        tokio::select! {
            response = &mut handled => response,
            _ = self.shared.shutdown_started() => {
                let grace = self.shared.grace_period();
                match tokio::time::timeout(grace, handled).await {
                    Ok(response) => response,
                    Err(_) => {
                        debug!(conn = %self.handle.id, ?grace, "Grace period elapsed, cancelling request");
                        Response::Cancelled
                    }
                }
            }
        }
    }

    async fn dispatch_detached(&self, request: String) -> Response {
        let handler = Arc::clone(self.shared.handler());
        let task = tokio::spawn(async move { handler.handle(request).await });

        let grace = self.shared.grace_period();
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(conn = %self.handle.id, error = %e, "Handler task failed");
                Response::Cancelled
            }
            Err(_) => {
                debug!(conn = %self.handle.id, ?grace, "Grace period elapsed, cancelling request");
                Response::Cancelled
            }
        }
    }
}

impl<H: Handler> Drop for Connection<H> {
    fn drop(&mut self) {
        self.set_state(ConnState::Closed);
        debug!(conn = %self.handle.id, peer = %self.handle.peer, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::unix_now;

    fn handle(id: u64) -> Arc<ConnHandle> {
        Arc::new(ConnHandle::new(
            ConnId::new(id),
            "127.0.0.1:40000".parse().unwrap(),
        ))
    }

    #[test]
    fn test_conn_id_display() {
        assert_eq!(ConnId::new(7).to_string(), "conn-7");
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new();
        let c1 = handle(1);
        let c2 = handle(2);

        registry.insert(&c1);
        registry.insert(&c2);
        registry.insert(&c1);
        assert_eq!(registry.len(), 2);
        assert!(registry.connections.contains_key(&c1.id));

        let removed = registry.remove(c1.id).unwrap();
        assert!(Arc::ptr_eq(&removed, &c1));
        assert!(!registry.connections.contains_key(&c1.id));
        assert!(registry.remove(c1.id).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_close_idle() {
        let policy = DrainPolicy::default();
        let now = unix_now();
        let mut registry = ConnectionRegistry::new();

        let idle = handle(1);
        idle.state.store_at(ConnState::Idle, now);
        let busy = handle(2);
        busy.state.store_at(ConnState::New, now);
        let stale = handle(3);
        stale.state.store_at(ConnState::New, now - 60);
        let unstamped = handle(4);

        for conn in [&idle, &busy, &stale, &unstamped] {
            registry.insert(conn);
        }

        assert!(!registry.close_idle(&policy, now));
        assert_eq!(registry.len(), 2);
        assert!(registry.connections.contains_key(&busy.id));
        assert!(registry.connections.contains_key(&unstamped.id));

        assert!(idle.is_closing());
        assert!(stale.is_closing());
        assert!(!busy.is_closing());
        assert!(!unstamped.is_closing());

        busy.state.store_at(ConnState::Idle, now);
        unstamped.state.store_at(ConnState::Idle, now);
        assert!(registry.close_idle(&policy, now));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_idle_empty_is_quiescent() {
        let mut registry = ConnectionRegistry::new();
        assert!(registry.close_idle(&DrainPolicy::default(), unix_now()));
    }
}
