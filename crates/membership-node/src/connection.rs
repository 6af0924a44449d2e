//! One TCP connection to a peer.
//!
//! A connection owns its socket and both framing state machines. The selector
//! never runs I/O itself: when the socket becomes ready it hands the connection
//! to the I/O pool, which calls [`Connection::handle_read`] or
//! [`Connection::handle_write`]. Those re-register interest before returning
//! when more work is pending.

use crate::error::TransportError;
use crate::frame::{FrameReader, FrameWriter, Progress};
use crate::multiplexer::{Registration, Shared};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Frames buffered behind the one in flight. Beyond this the oldest is
/// dropped: a newer heartbeat supersedes it anyway.
const MAX_QUEUED_FRAMES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by our listener
    Inbound,
    /// Opened by us to send gossip
    Outbound,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Connection {
    id: u64,
    role: Role,
    /// Remote socket address. For inbound connections this is the peer's
    /// ephemeral port, not its listen address.
    peer: SocketAddr,
    stream: TcpStream,
    reader: Mutex<FrameReader>,
    writer: Mutex<FrameWriter>,
    outgoing: Mutex<VecDeque<Bytes>>,
    /// Held by the frame in flight; released once it is fully flushed
    write_gate: Arc<Semaphore>,
    closed: AtomicBool,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        role: Role,
        peer: SocketAddr,
        stream: TcpStream,
        shared: Arc<Shared>,
    ) -> Arc<Self> {
        let max_frame_size = shared.config.max_frame_size;
        Arc::new(Self {
            id,
            role,
            peer,
            stream,
            reader: Mutex::new(FrameReader::new(max_frame_size)),
            writer: Mutex::new(FrameWriter::new(max_frame_size)),
            outgoing: Mutex::new(VecDeque::new()),
            write_gate: Arc::new(Semaphore::new(1)),
            closed: AtomicBool::new(false),
            cancel: shared.cancel.child_token(),
            shared,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Set up a connection accepted by the listener.
    pub(crate) fn handle_accept(self: &Arc<Self>) {
        self.configure_socket();
        debug!(conn = self.id, peer = %self.peer, "Accepted connection");
        self.register(Interest::READABLE);
    }

    /// Set up a connection we opened, and start flushing anything queued.
    pub(crate) fn handle_connect(self: &Arc<Self>) {
        self.configure_socket();
        debug!(conn = self.id, peer = %self.peer, "Connected");
        self.register(Interest::READABLE);
        self.pump();
    }

    fn configure_socket(&self) {
        if let Err(e) = self.stream.set_nodelay(true) {
            debug!(conn = self.id, error = %e, "Could not set TCP_NODELAY");
        }
    }

    /// Read every complete frame the socket offers and hand them to the
    /// dispatch pool.
    pub(crate) fn handle_read(self: &Arc<Self>) {
        let mut frames = Vec::new();
        let result = lock(&self.reader).read_from(&self.stream, &mut frames);
        for frame in frames {
            self.deliver(frame);
        }
        match result {
            Ok(Progress::Pending) => self.register(Interest::READABLE),
            Ok(_) => {
                debug!(conn = self.id, peer = %self.peer, "Peer closed connection");
                self.close();
            }
            Err(e) if e.is_protocol_error() => {
                warn!(conn = self.id, peer = %self.peer, error = %e, "Dropping connection");
                self.close();
            }
            Err(e) => {
                debug!(conn = self.id, peer = %self.peer, error = %e, "Read failed");
                self.close();
            }
        }
    }

    /// Continue flushing the frame in flight.
    pub(crate) fn handle_write(self: &Arc<Self>) {
        let result = lock(&self.writer).write_to(&self.stream);
        match result {
            Ok(Progress::Pending) => self.register(Interest::WRITABLE),
            Ok(Progress::Idle) => self.pump(),
            Ok(Progress::Closed) => {}
            Err(e) => {
                debug!(conn = self.id, peer = %self.peer, error = %e, "Write failed");
                self.close();
            }
        }
    }

    /// Queue an already wrapped payload. Never blocks.
    pub fn send(self: &Arc<Self>, payload: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        {
            let mut outgoing = lock(&self.outgoing);
            if outgoing.len() >= MAX_QUEUED_FRAMES {
                outgoing.pop_front();
                debug!(conn = self.id, "Send queue full, dropped oldest frame");
            }
            outgoing.push_back(payload);
        }
        self.pump();
        Ok(())
    }

    /// Start the next queued frame if nothing is in flight.
    fn pump(self: &Arc<Self>) {
        loop {
            let Ok(permit) = self.write_gate.clone().try_acquire_owned() else {
                return;
            };
            let Some(payload) = lock(&self.outgoing).pop_front() else {
                return;
            };
            let begun = lock(&self.writer).begin(payload, permit);
            match begun {
                Ok(()) => {
                    self.register(Interest::WRITABLE);
                    return;
                }
                Err(TransportError::Closed) => return,
                Err(e) => warn!(conn = self.id, error = %e, "Dropping outgoing frame"),
            }
        }
    }

    /// Hand one received payload to the application, in arrival order.
    fn deliver(self: &Arc<Self>, frame: Bytes) {
        let payload = match self.shared.security.unwrap(frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(conn = self.id, error = %e, "Rejected frame");
                return;
            }
        };
        trace!(conn = self.id, len = payload.len(), "Frame received");

        let handler = self.shared.handler.clone();
        let from = self.peer;
        let conn: Weak<Connection> = Arc::downgrade(self);
        self.shared.dispatch.submit(self.id, async move {
            if let Err(e) = handler.on_message(from, payload).await {
                warn!(peer = %from, error = %e, "Malformed message");
                if let Some(conn) = conn.upgrade() {
                    conn.close();
                }
            }
        });
    }

    /// Ask the selector to wake us when the socket is ready for `interest`.
    pub(crate) fn register(self: &Arc<Self>, interest: Interest) {
        if self.is_closed() {
            return;
        }
        let registration = Registration {
            conn: self.clone(),
            interest,
        };
        if self.shared.registrar.send(registration).is_err() {
            self.close();
        }
    }

    /// Close immediately. Idempotent; queued frames are discarded.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        lock(&self.reader).close();
        lock(&self.writer).close();
        lock(&self.outgoing).clear();
        self.shared.forget(self.id, self.role, self.peer);
        debug!(conn = self.id, peer = %self.peer, role = ?self.role, "Connection closed");
    }
}
