//! A running membership node: transport, gossip task and view notification.
//!
//! The gossip task exclusively owns the [`GossipEngine`]. Everything else talks
//! to it through channels: the transport forwards decoded messages and send
//! failures, and the task publishes the current view through a `watch` channel
//! and queues every change on the [`StabilityQueue`].

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::multiplexer::{MessageHandler, Multiplexer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use membership_core::{
    AttachmentHandler, AttachmentSource, GossipEngine, GossipMessage, Identity, Outbound,
    StabilityQueue, Subscription, ViewChange, ViewListener,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Events handed from the transport to the gossip task.
#[derive(Debug)]
enum Inbound {
    Message(GossipMessage),
    SendFailed(SocketAddr),
}

/// Decodes payloads on the dispatch pool so malformed data closes the
/// connection it arrived on.
struct GossipInbox {
    events: mpsc::UnboundedSender<Inbound>,
}

#[async_trait]
impl MessageHandler for GossipInbox {
    async fn on_message(&self, from: SocketAddr, payload: Bytes) -> Result<(), TransportError> {
        let message = GossipMessage::decode(payload)?;
        trace!(peer = %from, kind = message.kind(), "Gossip message");
        let _ = self.events.send(Inbound::Message(message));
        Ok(())
    }

    async fn send_failed(&self, to: SocketAddr, error: TransportError) {
        debug!(peer = %to, error = %error, "Send failed");
        let _ = self.events.send(Inbound::SendFailed(to));
    }
}

/// Optional application hooks riding on heartbeats.
#[derive(Default)]
pub struct Attachments {
    pub source: Option<Box<dyn AttachmentSource>>,
    pub handler: Option<Box<dyn AttachmentHandler>>,
}

pub struct MembershipNode {
    identity: Identity,
    local_addr: SocketAddr,
    transport: Arc<Multiplexer>,
    stability: Arc<StabilityQueue>,
    view: watch::Receiver<ViewChange>,
    cancel: CancellationToken,
    gossip_task: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipNode {
    pub async fn start(config: NodeConfig) -> Result<Self> {
        Self::start_with(config, Attachments::default()).await
    }

    /// Bind the transport and begin gossiping.
    pub async fn start_with(config: NodeConfig, attachments: Attachments) -> Result<Self> {
        config.validate().context("Invalid node configuration")?;

        let identity = config.identity();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Multiplexer::new(
            config.transport.clone(),
            Arc::new(GossipInbox { events: events_tx }),
        ));
        let bound = transport
            .start()
            .with_context(|| format!("Failed to bind {}", config.transport.bind))?;
        let local_addr = config.transport.advertise.unwrap_or(bound);

        let mut engine = GossipEngine::new(config.engine_config(identity, local_addr), now_ms());
        if let Some(source) = attachments.source {
            engine.set_attachment_source(source);
        }
        if let Some(handler) = attachments.handler {
            engine.set_attachment_handler(handler);
        }

        let stability = Arc::new(
            StabilityQueue::start().context("Failed to start view notification thread")?,
        );
        let (view_tx, view_rx) = watch::channel(engine.current_view());
        let cancel = CancellationToken::new();

        let gossip_task = tokio::spawn(run_gossip(GossipLoop {
            engine,
            transport: transport.clone(),
            events: events_rx,
            view: view_tx,
            stability: stability.clone(),
            interval: config.interval(),
            cancel: cancel.clone(),
        }));

        info!(
            node_id = identity.node_id,
            epoch = identity.epoch,
            addr = %local_addr,
            seeds = config.transport.seeds.len(),
            "Membership node started"
        );

        Ok(Self {
            identity,
            local_addr,
            transport,
            stability,
            view: view_rx,
            cancel,
            gossip_task: Mutex::new(Some(gossip_task)),
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Address advertised to peers.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Latest view produced by the gossip task.
    pub fn view(&self) -> ViewChange {
        *self.view.borrow()
    }

    /// Receiver that observes every published view.
    pub fn watch_view(&self) -> watch::Receiver<ViewChange> {
        self.view.clone()
    }

    /// Register a listener for future view changes. Dropping the returned
    /// subscription unregisters it.
    pub fn subscribe(&self, listener: Arc<dyn ViewListener>) -> Subscription {
        self.stability.subscribe(listener)
    }

    /// Stop gossiping, close the transport and discard undelivered view
    /// changes. Idempotent.
    pub async fn shutdown(&self) {
        let Some(task) = self.gossip_task.lock().await.take() else {
            return;
        };
        self.cancel.cancel();
        if let Err(e) = task.await {
            error!(error = %e, "Gossip task failed");
        }
        self.transport.terminate().await;

        let stability = self.stability.clone();
        let _ = tokio::task::spawn_blocking(move || stability.deactivate()).await;
        info!(node_id = self.identity.node_id, "Membership node stopped");
    }
}

impl Drop for MembershipNode {
    /// Without a prior `shutdown`, stops the gossip task. The transport closes
    /// once the task has released it.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct GossipLoop {
    engine: GossipEngine,
    transport: Arc<Multiplexer>,
    events: mpsc::UnboundedReceiver<Inbound>,
    view: watch::Sender<ViewChange>,
    stability: Arc<StabilityQueue>,
    interval: Duration,
    cancel: CancellationToken,
}

async fn run_gossip(mut state: GossipLoop) {
    let mut ticker = tokio::time::interval(state.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outbound = tokio::select! {
            _ = state.cancel.cancelled() => break,
            _ = ticker.tick() => state.engine.tick(now_ms()),
            Some(event) = state.events.recv() => match event {
                Inbound::Message(message) => state.engine.handle_message(message, now_ms()),
                Inbound::SendFailed(addr) => {
                    state.engine.send_failed(addr, now_ms());
                    Vec::new()
                }
            },
        };

        for Outbound { to, message } in outbound {
            if let Err(e) = state.transport.send(to, message.encode()) {
                debug!(peer = %to, error = %e, "Could not queue gossip");
            }
        }

        for change in state.engine.take_view_changes() {
            info!(
                view_number = change.view_number,
                members = ?change.view.members.iter().collect::<Vec<_>>(),
                leader = change.leader,
                stable = change.view.stable,
                "View changed"
            );
            state.view.send_replace(change);
            state.stability.put(change);
        }
    }
    debug!("Gossip task stopped");
}
