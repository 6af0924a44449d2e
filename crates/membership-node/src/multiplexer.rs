//! Selector loop multiplexing every peer connection of a node.
//!
//! One task owns the listener and all pending readiness interests. Handlers
//! ask for readiness through a registration queue; the selector drains it on
//! every iteration, waits for the first ready socket and hands the connection
//! to the I/O pool. The readiness future is consumed by that hand-off, so at
//! most one task per connection and direction runs at a time. Application
//! callbacks run on the separate dispatch pool.

use crate::config::TransportConfig;
use crate::connection::{lock, Connection, Role};
use crate::error::TransportError;
use crate::pool::{DispatchPool, IoPool};
use crate::security::{NoSecurity, WireSecurity};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Application side of the transport.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// A complete payload arrived. Returning an error closes the connection
    /// it came from.
    async fn on_message(&self, from: SocketAddr, payload: Bytes) -> Result<(), TransportError>;

    /// A send could not be delivered because the peer could not be reached.
    async fn send_failed(&self, to: SocketAddr, error: TransportError);
}

/// Request from a connection to be woken when its socket is ready.
pub(crate) struct Registration {
    pub(crate) conn: Arc<Connection>,
    pub(crate) interest: Interest,
}

type Readiness = (Arc<Connection>, Interest, Option<io::Result<Ready>>);

/// State shared between the selector, the pools and every connection.
pub(crate) struct Shared {
    pub(crate) config: TransportConfig,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) security: Arc<dyn WireSecurity>,
    pub(crate) registrar: mpsc::UnboundedSender<Registration>,
    pub(crate) io_pool: IoPool,
    pub(crate) dispatch: DispatchPool,
    pub(crate) cancel: CancellationToken,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    /// Cached connections we opened, by remote listen address
    outbound: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    /// Payloads waiting for a connect in progress
    connecting: Mutex<HashMap<SocketAddr, Vec<Bytes>>>,
    next_id: AtomicU64,
}

impl Shared {
    /// Track a freshly accepted or connected stream.
    fn adopt(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, role: Role) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(id, role, peer, stream, self.clone());
        lock(&self.connections).insert(id, conn.clone());
        if role == Role::Outbound {
            let stale = lock(&self.outbound).insert(peer, conn.clone());
            if let Some(stale) = stale {
                stale.close();
            }
        }
        if self.cancel.is_cancelled() {
            conn.close();
        }
        conn
    }

    /// Drop a closed connection from the tables.
    pub(crate) fn forget(&self, id: u64, role: Role, peer: SocketAddr) {
        lock(&self.connections).remove(&id);
        if role == Role::Outbound {
            let mut outbound = lock(&self.outbound);
            if outbound.get(&peer).is_some_and(|conn| conn.id() == id) {
                outbound.remove(&peer);
            }
        }
    }

    fn send(self: &Arc<Self>, to: SocketAddr, payload: Bytes) {
        let mut connecting = lock(&self.connecting);
        if let Some(queued) = connecting.get_mut(&to) {
            queued.push(payload);
            return;
        }
        let cached = lock(&self.outbound).get(&to).cloned();
        if let Some(conn) = cached {
            if conn.send(payload.clone()).is_ok() {
                return;
            }
        }
        connecting.insert(to, vec![payload]);
        drop(connecting);

        let shared = self.clone();
        if !self.io_pool.spawn(async move { shared.connect(to).await }) {
            lock(&self.connecting).remove(&to);
        }
    }

    async fn connect(self: Arc<Self>, to: SocketAddr) {
        let attempt = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(to)).await;
        let result = match attempt {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("connect timed out after {:?}", self.config.connect_timeout())),
        };

        let mut connecting = lock(&self.connecting);
        let queued = connecting.remove(&to).unwrap_or_default();
        match result {
            Ok(stream) => {
                let conn = self.adopt(stream, to, Role::Outbound);
                for payload in queued {
                    if conn.send(payload).is_err() {
                        break;
                    }
                }
                drop(connecting);
                conn.handle_connect();
            }
            Err(reason) => {
                drop(connecting);
                debug!(peer = %to, %reason, dropped = queued.len(), "Connect failed");
                let handler = self.handler.clone();
                self.dispatch.submit(u64::from(to.port()), async move {
                    handler
                        .send_failed(to, TransportError::PeerUnreachable { addr: to, reason })
                        .await;
                });
            }
        }
    }

    fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    fn close_all(&self) {
        let open: Vec<_> = lock(&self.connections).values().cloned().collect();
        for conn in open {
            conn.close();
        }
        lock(&self.connecting).clear();
    }
}

struct Running {
    shared: Arc<Shared>,
    selector: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Non-blocking TCP transport for framed payloads.
pub struct Multiplexer {
    config: TransportConfig,
    handler: Arc<dyn MessageHandler>,
    security: Arc<dyn WireSecurity>,
    running: AtomicBool,
    state: Mutex<Option<Running>>,
}

impl Multiplexer {
    pub fn new(config: TransportConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self::with_security(config, handler, Arc::new(NoSecurity))
    }

    pub fn with_security(
        config: TransportConfig,
        handler: Arc<dyn MessageHandler>,
        security: Arc<dyn WireSecurity>,
    ) -> Self {
        Self {
            config,
            handler,
            security,
            running: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    /// Bind the listener and start the selector. Must run inside a tokio
    /// runtime. Starting a running multiplexer returns its address again.
    pub fn start(&self) -> Result<SocketAddr, TransportError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.local_addr().ok_or(TransportError::ShutDown);
        }

        let bound = self
            .bind()
            .and_then(|listener| Ok((listener.local_addr()?, listener)));
        let (local_addr, listener) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let (registrar, registrations) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config: self.config.clone(),
            handler: self.handler.clone(),
            security: self.security.clone(),
            registrar,
            io_pool: IoPool::new(self.config.io_workers, cancel.child_token()),
            dispatch: DispatchPool::new(
                self.config.dispatch_workers,
                self.config.dispatch_queue_capacity,
                cancel.child_token(),
            ),
            cancel,
            connections: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        let selector = tokio::spawn(run_selector(shared.clone(), listener, registrations));
        info!(addr = %local_addr, "Transport listening");

        *lock(&self.state) = Some(Running {
            shared,
            selector,
            local_addr,
        });
        Ok(local_addr)
    }

    fn bind(&self) -> io::Result<TcpListener> {
        let addr = self.config.bind;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        if let Some(size) = self.config.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.config.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        socket.bind(addr)?;
        socket.listen(self.config.backlog)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.state).as_ref().map(|running| running.local_addr)
    }

    /// Open connections, inbound and outbound.
    pub fn connection_count(&self) -> usize {
        lock(&self.state)
            .as_ref()
            .map_or(0, |running| running.shared.connection_count())
    }

    /// Send `payload` to the peer listening at `to`.
    ///
    /// Returns immediately. Delivery failures are reported through
    /// [`MessageHandler::send_failed`].
    pub fn send(&self, to: SocketAddr, payload: Bytes) -> Result<(), TransportError> {
        let shared = match lock(&self.state).as_ref() {
            Some(running) if self.is_running() => running.shared.clone(),
            _ => return Err(TransportError::ShutDown),
        };
        let wrapped = shared.security.wrap(payload)?;
        if wrapped.len() > shared.config.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: wrapped.len(),
                max: shared.config.max_frame_size,
            });
        }
        shared.send(to, wrapped);
        Ok(())
    }

    /// Stop the selector, discard queued pool work and close every
    /// connection. Idempotent.
    pub async fn terminate(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(running) = lock(&self.state).take() else {
            return;
        };
        let shared = running.shared;
        shared.cancel.cancel();
        shared.close_all();
        shared.io_pool.shutdown().await;
        shared.dispatch.shutdown().await;
        if let Err(e) = running.selector.await {
            error!(error = %e, "Selector task failed");
        }
        // Anything accepted between the first sweep and the selector exiting
        shared.close_all();
        info!(addr = %running.local_addr, "Transport stopped");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.state).take() {
            running.shared.cancel.cancel();
            running.shared.close_all();
        }
    }
}

fn watch(registration: Registration) -> BoxFuture<'static, Readiness> {
    let Registration { conn, interest } = registration;
    async move {
        let ready = tokio::select! {
            _ = conn.cancelled().cancelled() => None,
            ready = conn.stream().ready(interest) => Some(ready),
        };
        (conn, interest, ready)
    }
    .boxed()
}

async fn run_selector(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut registrations: mpsc::UnboundedReceiver<Registration>,
) {
    let mut pending = FuturesUnordered::new();
    let select_timeout = shared.config.select_timeout();

    loop {
        while let Ok(registration) = registrations.try_recv() {
            pending.push(watch(registration));
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = shared.adopt(stream, peer, Role::Inbound);
                    conn.handle_accept();
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            Some(registration) = registrations.recv() => {
                pending.push(watch(registration));
            }
            Some((conn, interest, ready)) = pending.next(), if !pending.is_empty() => {
                dispatch(&shared, conn, interest, ready);
            }
            _ = tokio::time::sleep(select_timeout) => {
                trace!(interests = pending.len(), "Selector idle");
            }
        }
    }
    debug!("Selector stopped");
}

fn dispatch(
    shared: &Arc<Shared>,
    conn: Arc<Connection>,
    interest: Interest,
    ready: Option<io::Result<Ready>>,
) {
    match ready {
        None => {}
        Some(Err(e)) => {
            debug!(conn = conn.id(), error = %e, "Readiness failed");
            conn.close();
        }
        Some(Ok(_)) => {
            let task_conn = conn.clone();
            let spawned = shared.io_pool.spawn(async move {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    if interest.is_readable() {
                        task_conn.handle_read();
                    } else {
                        task_conn.handle_write();
                    }
                }));
                if outcome.is_err() {
                    error!(conn = task_conn.id(), "Connection handler panicked");
                    task_conn.close();
                }
            });
            if !spawned {
                conn.close();
            }
        }
    }
}
