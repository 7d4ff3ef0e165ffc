//! Connection manager: owns every peer's transport and outbound queue.
//!
//! Each peer moves through
//! `Idle → ConnectingDirect → (Connected | NegotiatingChannel) → Connected → Closed`.
//! The first send to an unseen call sign looks the peer up through the
//! rendezvous service, tries a direct socket to its advertised address and,
//! failing that, negotiates a channel over the signaling relay. Frames sent
//! before a transport opens wait in a per-peer FIFO and are flushed in order
//! the moment one does.
//!
//! Every establishment attempt carries the peer's generation number at the
//! time it started. Anything that supersedes the attempt (an adopted inbound
//! link, a remote offer, an opened channel) bumps the generation, so late
//! outcomes of the old attempt are recognised and discarded.

use crate::discovery::DiscoveryClient;
use crate::link::{connect_direct, DirectLink, FrameSender, LinkEvent, LinkEventSender, LinkId};
use crate::message::{from_json, Frame, IceCandidate, SdpKind, SessionDescription};
use crate::negotiator::{ChannelEvent, ChannelNegotiator, NegotiatedLink, PeerChannel};
use crate::signaling::{SignalMessage, SignalingRelay};

use chrono::{DateTime, Utc};
use realm_types::{RealmConfig, RealmError, RealmResult};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Capacity of the state-change broadcast channel.
const STATE_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Known but never connected.
    Idle,
    /// Direct-socket attempt in progress.
    ConnectingDirect,
    /// Channel negotiation through the signaling relay in progress.
    NegotiatingChannel,
    /// A transport is open.
    Connected,
    /// Transport gone or establishment failed; the next send retries.
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Idle => "idle",
            PeerState::ConnectingDirect => "connecting_direct",
            PeerState::NegotiatingChannel => "negotiating_channel",
            PeerState::Connected => "connected",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Direct,
    Negotiated,
}

/// The single live transport of a peer.
#[derive(Debug)]
pub enum Transport {
    Direct(DirectLink),
    Negotiated(NegotiatedLink),
}

impl Transport {
    pub fn id(&self) -> LinkId {
        match self {
            Transport::Direct(link) => link.id(),
            Transport::Negotiated(link) => link.id(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Direct(_) => TransportKind::Direct,
            Transport::Negotiated(_) => TransportKind::Negotiated,
        }
    }

    fn send(&self, frame: Frame) -> Result<(), Frame> {
        match self {
            Transport::Direct(link) => link.send(frame),
            Transport::Negotiated(link) => link.send(frame),
        }
    }

    fn sender(&self) -> FrameSender {
        match self {
            Transport::Direct(link) => link.sender(),
            Transport::Negotiated(link) => link.sender(),
        }
    }

    fn close(self) {
        match self {
            Transport::Direct(link) => link.close(),
            Transport::Negotiated(link) => link.close(),
        }
    }
}

/// A published state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub call_sign: String,
    pub from: PeerState,
    pub to: PeerState,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub call_sign: String,
    pub state: PeerState,
    pub transport: Option<TransportKind>,
    pub link: Option<LinkId>,
    pub connected_at: Option<DateTime<Utc>>,
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

/// In-flight channel negotiation with one peer.
struct NegotiationSession {
    role: Role,
    channel: Option<Arc<dyn PeerChannel>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_candidates: usize,
    /// Remote candidates waiting for the remote description.
    buffered_candidates: Vec<IceCandidate>,
    /// Local candidates waiting for our description to go out first.
    pending_local: Vec<IceCandidate>,
    pump: Option<AbortHandle>,
    timer: Option<AbortHandle>,
}

impl NegotiationSession {
    fn new(role: Role) -> Self {
        Self {
            role,
            channel: None,
            local_description: None,
            remote_description: None,
            remote_candidates: 0,
            buffered_candidates: Vec::new(),
            pending_local: Vec::new(),
            pump: None,
            timer: None,
        }
    }

    fn abandon(self) {
        debug!(
            role = ?self.role,
            remote_candidates = self.remote_candidates,
            had_local = self.local_description.is_some(),
            had_remote = self.remote_description.is_some(),
            "Abandoning negotiation session"
        );
        if let Some(timer) = self.timer {
            timer.abort();
        }
        if let Some(pump) = self.pump {
            pump.abort();
        }
        if let Some(channel) = self.channel {
            tokio::spawn(async move { channel.close().await });
        }
    }
}

struct Outbound {
    frame: Frame,
    done: oneshot::Sender<RealmResult<()>>,
}

struct PeerConnection {
    state: PeerState,
    transport: Option<Transport>,
    queue: VecDeque<Outbound>,
    generation: u64,
    /// A lookup or direct attempt is running for the current generation.
    establishing: bool,
    session: Option<NegotiationSession>,
    connected_at: Option<DateTime<Utc>>,
    /// Direct links replaced by a better one but still draining; frames
    /// arriving on them are routed until they close.
    retiring: Vec<DirectLink>,
}

impl PeerConnection {
    fn new() -> Self {
        Self {
            state: PeerState::Idle,
            transport: None,
            queue: VecDeque::new(),
            generation: 0,
            establishing: false,
            session: None,
            connected_at: None,
            retiring: Vec::new(),
        }
    }

    /// Take `transport` out of service. Direct links drain first.
    fn retire(&mut self, call_sign: &str, transport: Transport) {
        match transport {
            Transport::Direct(link) => {
                debug!(call_sign, link = link.id(), "Retiring direct link");
                link.retire();
                self.retiring.push(link);
            }
            Transport::Negotiated(link) => link.close(),
        }
    }
}

struct ManagerInner {
    local: String,
    peers: Mutex<HashMap<String, PeerConnection>>,
    discovery: DiscoveryClient,
    relay: SignalingRelay,
    negotiator: Arc<dyn ChannelNegotiator>,
    link_events: LinkEventSender,
    state_tx: broadcast::Sender<StateChange>,
    signal_tx: mpsc::UnboundedSender<SignalMessage>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalMessage>>>,
    signal_task: Mutex<Option<AbortHandle>>,
    direct_timeout: Duration,
    negotiation_timeout: Duration,
    max_queued: usize,
    shut_down: AtomicBool,
}

impl ManagerInner {
    fn lock_peers(&self) -> MutexGuard<'_, HashMap<String, PeerConnection>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, call_sign: &str, peer: &mut PeerConnection, to: PeerState) {
        let from = peer.state;
        if from == to {
            return;
        }
        peer.state = to;
        if to != PeerState::Connected {
            peer.connected_at = None;
        }
        info!(call_sign, from = %from, to = %to, "Peer state changed");
        let _ = self.state_tx.send(StateChange {
            call_sign: call_sign.to_string(),
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Make `transport` the peer's only transport and flush its queue.
    fn install(&self, call_sign: &str, peer: &mut PeerConnection, transport: Transport) {
        if let Some(old) = peer.transport.take() {
            debug!(call_sign, old = old.id(), new = transport.id(), "Replacing transport");
            peer.retire(call_sign, old);
        }
        if let Some(session) = peer.session.take() {
            session.abandon();
        }
        peer.generation += 1;
        peer.establishing = false;
        peer.connected_at = Some(Utc::now());
        info!(
            call_sign,
            link = transport.id(),
            transport = ?transport.kind(),
            queued = peer.queue.len(),
            "Transport open"
        );
        self.set_state(call_sign, peer, PeerState::Connected);

        while let Some(out) = peer.queue.pop_front() {
            let result = transport.send(out.frame).map_err(|_| {
                RealmError::unreachable(call_sign, "transport closed while flushing")
            });
            let _ = out.done.send(result);
        }
        peer.transport = Some(transport);
    }

    /// Settle a failed establishment attempt, unless it was superseded.
    fn fail(&self, call_sign: &str, generation: u64, error: RealmError) {
        let mut peers = self.lock_peers();
        let Some(peer) = peers.get_mut(call_sign) else {
            return;
        };
        if peer.generation != generation || peer.transport.is_some() {
            debug!(call_sign, generation, "Ignoring outcome of superseded attempt");
            return;
        }
        if let Some(session) = peer.session.take() {
            session.abandon();
        }
        peer.establishing = false;
        warn!(call_sign, queued = peer.queue.len(), error = %error, "Peer unreachable");
        self.set_state(call_sign, peer, PeerState::Closed);
        for out in peer.queue.drain(..) {
            let _ = out.done.send(Err(error.clone()));
        }
    }
}

/// Per-peer transport state machine. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        config: &RealmConfig,
        discovery: DiscoveryClient,
        negotiator: Arc<dyn ChannelNegotiator>,
        link_events: LinkEventSender,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let relay = SignalingRelay::new(discovery.clone());
        Self {
            inner: Arc::new(ManagerInner {
                local: config.call_sign.clone(),
                peers: Mutex::new(HashMap::new()),
                discovery,
                relay,
                negotiator,
                link_events,
                state_tx,
                signal_tx,
                signal_rx: Mutex::new(Some(signal_rx)),
                signal_task: Mutex::new(None),
                direct_timeout: config.direct_connect_timeout(),
                negotiation_timeout: config.negotiation_timeout(),
                max_queued: config.max_queued_frames,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Start consuming inbound signaling. Signals are handled one at a time,
    /// in arrival order.
    pub fn start(&self) {
        let Some(mut signals) = self
            .inner
            .signal_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let signal_tx = self.inner.signal_tx.clone();
        self.inner.relay.on_signal(move |msg| {
            let _ = signal_tx.send(msg);
        });
        let manager = self.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = signals.recv().await {
                manager.handle_signal(msg).await;
            }
        });
        *self
            .inner
            .signal_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task.abort_handle());
    }

    pub fn local_call_sign(&self) -> &str {
        &self.inner.local
    }

    /// Subscribe to peer state transitions.
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state_tx.subscribe()
    }

    pub fn peer_state(&self, call_sign: &str) -> Option<PeerState> {
        self.inner.lock_peers().get(call_sign).map(|p| p.state)
    }

    /// Snapshot of every known peer, sorted by call sign.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let peers = self.inner.lock_peers();
        let mut out: Vec<PeerSnapshot> = peers
            .iter()
            .map(|(call_sign, peer)| PeerSnapshot {
                call_sign: call_sign.clone(),
                state: peer.state,
                transport: peer.transport.as_ref().map(Transport::kind),
                link: peer.transport.as_ref().map(Transport::id),
                connected_at: peer.connected_at,
                queued: peer.queue.len(),
            })
            .collect();
        out.sort_by(|a, b| a.call_sign.cmp(&b.call_sign));
        out
    }

    /// Hand `frame` to the peer's transport, or queue it and start
    /// establishing one. The receiver settles once the frame reaches a
    /// transport or the attempt fails.
    pub fn enqueue(
        &self,
        target: &str,
        frame: Frame,
    ) -> RealmResult<oneshot::Receiver<RealmResult<()>>> {
        let (done, rx) = oneshot::channel();
        let mut peers = self.inner.lock_peers();
        let peer = peers
            .entry(target.to_string())
            .or_insert_with(PeerConnection::new);

        let mut frame = frame;
        if let Some(transport) = peer.transport.as_ref() {
            match transport.send(frame) {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                    return Ok(rx);
                }
                Err(returned) => frame = returned,
            }
            // The writer is gone; its close event may still be in flight.
            if let Some(dead) = peer.transport.take() {
                debug!(call_sign = target, link = dead.id(), "Dropping dead transport");
                dead.close();
            }
            self.inner.set_state(target, peer, PeerState::Closed);
        }

        if peer.queue.len() >= self.inner.max_queued {
            return Err(RealmError::QueueFull {
                call_sign: target.to_string(),
                capacity: self.inner.max_queued,
            });
        }
        peer.queue.push_back(Outbound { frame, done });

        if !peer.establishing && matches!(peer.state, PeerState::Idle | PeerState::Closed) {
            peer.generation += 1;
            peer.establishing = true;
            let generation = peer.generation;
            let manager = self.clone();
            let target = target.to_string();
            tokio::spawn(async move { manager.establish(target, generation).await });
        }
        Ok(rx)
    }

    /// Enqueue and wait until the frame reaches a transport.
    pub async fn send(&self, target: &str, frame: Frame) -> RealmResult<()> {
        let rx = self.enqueue(target, frame)?;
        rx.await
            .unwrap_or_else(|_| Err(RealmError::Cancelled(format!("send to {target}"))))
    }

    /// Bind an inbound, already-handshaked direct socket to `call_sign`.
    pub fn adopt_inbound(&self, call_sign: &str, stream: TcpStream) {
        self.adopt_direct(call_sign, stream, call_sign);
    }

    /// Where to answer a frame that arrived on `link_id`, or `None` if the
    /// link is stale and the frame should be dropped.
    ///
    /// Frames on the current link answer on that link. Frames on a retiring
    /// link are still delivered, but answers go out on the current
    /// transport since the retiring link no longer writes.
    pub fn reply_route(
        &self,
        call_sign: &str,
        link_id: LinkId,
        reply: &FrameSender,
    ) -> Option<FrameSender> {
        let peers = self.inner.lock_peers();
        let peer = peers.get(call_sign)?;
        let current = peer.transport.as_ref();
        if current.is_some_and(|t| t.id() == link_id) {
            return Some(reply.clone());
        }
        if peer.retiring.iter().any(|l| l.id() == link_id) {
            return Some(current.map_or_else(|| reply.clone(), Transport::sender));
        }
        None
    }

    /// A link reported it closed on its own.
    pub fn link_closed(&self, call_sign: &str, link_id: LinkId) {
        let mut peers = self.inner.lock_peers();
        let Some(peer) = peers.get_mut(call_sign) else {
            return;
        };
        if let Some(pos) = peer.retiring.iter().position(|l| l.id() == link_id) {
            // Dropped, not closed: the writer may still be flushing.
            debug!(call_sign, link = link_id, "Retired link drained");
            peer.retiring.swap_remove(pos);
            return;
        }
        if peer.transport.as_ref().map(Transport::id) != Some(link_id) {
            debug!(call_sign, link = link_id, "Ignoring close of stale link");
            return;
        }
        match peer.transport.take() {
            // The peer hung up its side; let our writer flush before closing.
            Some(Transport::Direct(link)) => link.retire(),
            Some(other) => other.close(),
            None => {}
        }
        info!(call_sign, link = link_id, "Transport closed");
        self.inner.set_state(call_sign, peer, PeerState::Closed);
    }

    /// Close every transport and fail everything still queued. Links that
    /// finish their handshake afterwards are refused.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Some(task) = self
            .inner
            .signal_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        let mut peers = self.inner.lock_peers();
        for (call_sign, peer) in peers.iter_mut() {
            if let Some(transport) = peer.transport.take() {
                transport.close();
            }
            for link in peer.retiring.drain(..) {
                link.close();
            }
            if let Some(session) = peer.session.take() {
                session.abandon();
            }
            peer.generation += 1;
            peer.establishing = false;
            for out in peer.queue.drain(..) {
                let _ = out.done.send(Err(RealmError::NotRunning));
            }
            self.inner.set_state(call_sign, peer, PeerState::Closed);
        }
    }

    async fn establish(&self, target: String, generation: u64) {
        let status = self.inner.discovery.query_peer_status(&target).await;
        if !status.online {
            self.inner.fail(
                &target,
                generation,
                RealmError::unreachable(&target, "peer is offline"),
            );
            return;
        }
        if !self.advance(&target, generation, PeerState::ConnectingDirect) {
            return;
        }

        match status.address.as_deref() {
            Some(addr) => {
                match connect_direct(addr, &self.inner.local, &target, self.inner.direct_timeout)
                    .await
                {
                    Ok(stream) => {
                        let local = self.inner.local.clone();
                        self.adopt_direct(&target, stream, &local);
                        return;
                    }
                    Err(e) => {
                        debug!(call_sign = %target, address = addr, error = %e, "Direct connection failed");
                    }
                }
            }
            None => debug!(call_sign = %target, "Peer advertises no address"),
        }

        self.offer(&target, generation).await;
    }

    /// Move to `to` if the attempt is still current.
    fn advance(&self, target: &str, generation: u64, to: PeerState) -> bool {
        let mut peers = self.inner.lock_peers();
        match peers.get_mut(target) {
            Some(peer) if peer.generation == generation && peer.transport.is_none() => {
                self.inner.set_state(target, peer, to);
                true
            }
            _ => {
                debug!(call_sign = target, generation, "Attempt superseded");
                false
            }
        }
    }

    fn adopt_direct(&self, call_sign: &str, stream: TcpStream, initiator: &str) {
        // Lock first: the reader must not report frames before the link is
        // installed, or the dispatcher would discard them as stale.
        let mut peers = self.inner.lock_peers();
        if self.inner.shut_down.load(Ordering::SeqCst) {
            debug!(call_sign, "Refusing direct link after shutdown");
            return;
        }
        let link = DirectLink::spawn(
            stream,
            call_sign,
            initiator,
            self.inner.link_events.clone(),
        );
        let peer = peers
            .entry(call_sign.to_string())
            .or_insert_with(PeerConnection::new);

        // Two direct links raced: both sides keep the one dialed by the
        // smaller call sign. The loser drains, since the other side may
        // already have flushed frames onto it.
        if let Some(Transport::Direct(existing)) = &peer.transport {
            if existing.initiator() != link.initiator() && existing.initiator() < link.initiator()
            {
                debug!(
                    call_sign,
                    kept = existing.id(),
                    dropped = link.id(),
                    "Duplicate direct link"
                );
                peer.retire(call_sign, Transport::Direct(link));
                return;
            }
        }
        self.inner.install(call_sign, peer, Transport::Direct(link));
    }

    async fn offer(&self, target: &str, generation: u64) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let mut peers = self.inner.lock_peers();
            let Some(peer) = peers.get_mut(target) else {
                return;
            };
            if peer.generation != generation || peer.transport.is_some() {
                return;
            }
            self.inner
                .set_state(target, peer, PeerState::NegotiatingChannel);
            let mut session = NegotiationSession::new(Role::Offerer);
            session.pump = Some(self.spawn_pump(target, generation, events_rx));
            session.timer = Some(self.spawn_negotiation_timer(target, generation));
            peer.session = Some(session);
        }

        let (channel, offer) = match self.inner.negotiator.create_offer(target, events_tx).await {
            Ok(created) => created,
            Err(e) => {
                self.inner
                    .fail(target, generation, RealmError::unreachable(target, e.to_string()));
                return;
            }
        };

        let installed = {
            let mut peers = self.inner.lock_peers();
            match peers.get_mut(target) {
                Some(peer) if peer.generation == generation => match peer.session.as_mut() {
                    Some(session) if session.role == Role::Offerer => {
                        session.channel = Some(Arc::clone(&channel));
                        self.publish_description(target, session, offer);
                        true
                    }
                    _ => false,
                },
                _ => false,
            }
        };
        if !installed {
            debug!(call_sign = target, "Offer superseded before it was sent");
            channel.close().await;
        }
    }

    /// Send our description, then any local candidates gathered before it.
    /// Runs under the peers lock so candidates never overtake the description.
    fn publish_description(
        &self,
        target: &str,
        session: &mut NegotiationSession,
        description: SessionDescription,
    ) {
        session.local_description = Some(description.clone());
        let sent = match description.kind {
            SdpKind::Offer => self.inner.relay.send_offer(target, description),
            SdpKind::Answer => self.inner.relay.send_answer(target, description),
        };
        if let Err(e) = sent {
            warn!(call_sign = target, error = %e, "Failed to relay description");
        }
        for candidate in session.pending_local.drain(..) {
            let _ = self.inner.relay.send_candidate(target, candidate);
        }
    }

    fn spawn_negotiation_timer(&self, target: &str, generation: u64) -> AbortHandle {
        let inner = Arc::clone(&self.inner);
        let target = target.to_string();
        let timeout = self.inner.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner.fail(
                &target,
                generation,
                RealmError::unreachable(&target, format!("negotiation timed out after {timeout:?}")),
            );
        })
        .abort_handle()
    }

    /// Forward a negotiated channel's events until it closes.
    fn spawn_pump(
        &self,
        target: &str,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> AbortHandle {
        let manager = self.clone();
        let target = target.to_string();
        tokio::spawn(async move {
            let mut bound: Option<(LinkId, FrameSender)> = None;
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::LocalCandidate(candidate) => {
                        manager.local_candidate(&target, generation, candidate);
                    }
                    ChannelEvent::Open(pipe) => {
                        bound = manager.channel_open(&target, generation, pipe);
                        if bound.is_none() {
                            return;
                        }
                    }
                    ChannelEvent::Message(bytes) => {
                        let Some((link_id, reply)) = &bound else {
                            debug!(call_sign = %target, "Dropping message before channel open");
                            continue;
                        };
                        match from_json(&bytes) {
                            Ok(frame) => {
                                let event = LinkEvent::Frame {
                                    call_sign: target.clone(),
                                    link_id: *link_id,
                                    reply: reply.clone(),
                                    frame,
                                };
                                if manager.inner.link_events.send(event).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(call_sign = %target, link = *link_id, error = %e, "Dropping malformed frame");
                            }
                        }
                    }
                    ChannelEvent::Closed(reason) => {
                        match &bound {
                            Some((link_id, _)) => {
                                let _ = manager.inner.link_events.send(LinkEvent::Closed {
                                    call_sign: target.clone(),
                                    link_id: *link_id,
                                });
                            }
                            None => manager.inner.fail(
                                &target,
                                generation,
                                RealmError::unreachable(&target, reason),
                            ),
                        }
                        return;
                    }
                }
            }
        })
        .abort_handle()
    }

    fn local_candidate(&self, target: &str, generation: u64, candidate: IceCandidate) {
        let mut peers = self.inner.lock_peers();
        let Some(session) = peers
            .get_mut(target)
            .filter(|p| p.generation == generation)
            .and_then(|p| p.session.as_mut())
        else {
            return;
        };
        if session.local_description.is_some() {
            if let Err(e) = self.inner.relay.send_candidate(target, candidate) {
                debug!(call_sign = target, error = %e, "Failed to relay candidate");
            }
        } else {
            session.pending_local.push(candidate);
        }
    }

    fn channel_open(
        &self,
        target: &str,
        generation: u64,
        pipe: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Option<(LinkId, FrameSender)> {
        let mut peers = self.inner.lock_peers();
        let peer = peers.get_mut(target)?;
        if peer.generation != generation || self.inner.shut_down.load(Ordering::SeqCst) {
            debug!(call_sign = target, "Channel opened for a superseded negotiation");
            return None;
        }
        let mut session = peer.session.take()?;
        let Some(channel) = session.channel.take() else {
            warn!(call_sign = target, "Channel opened before negotiation finished");
            peer.session = Some(session);
            return None;
        };
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }

        let mut link = NegotiatedLink::spawn(target, channel, pipe);
        if let Some(pump) = session.pump.take() {
            link = link.with_reader(pump);
        }
        let bound = (link.id(), link.sender());
        self.inner
            .install(target, peer, Transport::Negotiated(link));
        Some(bound)
    }

    async fn handle_signal(&self, msg: SignalMessage) {
        let SignalMessage {
            from,
            sdp,
            candidate,
        } = msg;
        if from.is_empty() || from == self.inner.local {
            warn!(from = %from, "Dropping signal with invalid sender");
            return;
        }
        if let Some(sdp) = sdp {
            match sdp.kind {
                SdpKind::Offer => self.on_offer(&from, sdp).await,
                SdpKind::Answer => self.on_answer(&from, sdp).await,
            }
        }
        if let Some(candidate) = candidate {
            self.on_candidate(&from, candidate).await;
        }
    }

    async fn on_offer(&self, from: &str, offer: SessionDescription) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let generation = {
            let mut peers = self.inner.lock_peers();
            let peer = peers
                .entry(from.to_string())
                .or_insert_with(PeerConnection::new);

            if let Some(session) = &peer.session {
                if session.role == Role::Offerer && self.inner.local.as_str() < from {
                    debug!(call_sign = from, "Offer glare, keeping our own offer");
                    return;
                }
            }
            if let Some(session) = peer.session.take() {
                debug!(call_sign = from, "Answering remote offer instead of our own");
                session.abandon();
            }
            if let Some(old) = peer.transport.take() {
                debug!(call_sign = from, link = old.id(), "Remote offered a new channel");
                peer.retire(from, old);
            }

            peer.generation += 1;
            peer.establishing = false;
            let generation = peer.generation;
            self.inner
                .set_state(from, peer, PeerState::NegotiatingChannel);
            let mut session = NegotiationSession::new(Role::Answerer);
            session.remote_description = Some(offer.clone());
            session.pump = Some(self.spawn_pump(from, generation, events_rx));
            session.timer = Some(self.spawn_negotiation_timer(from, generation));
            peer.session = Some(session);
            generation
        };

        let (channel, answer) =
            match self.inner.negotiator.accept_offer(from, &offer, events_tx).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.inner
                        .fail(from, generation, RealmError::unreachable(from, e.to_string()));
                    return;
                }
            };

        let buffered = {
            let mut peers = self.inner.lock_peers();
            match peers
                .get_mut(from)
                .filter(|p| p.generation == generation)
                .and_then(|p| p.session.as_mut())
            {
                Some(session) if session.role == Role::Answerer => {
                    session.channel = Some(Arc::clone(&channel));
                    self.publish_description(from, session, answer);
                    Some(std::mem::take(&mut session.buffered_candidates))
                }
                _ => None,
            }
        };
        match buffered {
            Some(candidates) => apply_candidates(from, &channel, candidates).await,
            None => {
                debug!(call_sign = from, "Answer superseded before it was sent");
                channel.close().await;
            }
        }
    }

    async fn on_answer(&self, from: &str, answer: SessionDescription) {
        let (channel, generation, buffered) = {
            let mut peers = self.inner.lock_peers();
            let Some(peer) = peers.get_mut(from) else {
                debug!(call_sign = from, "Answer from unknown peer");
                return;
            };
            let generation = peer.generation;
            match peer.session.as_mut() {
                Some(session)
                    if session.role == Role::Offerer && session.remote_description.is_none() =>
                {
                    let Some(channel) = session.channel.clone() else {
                        debug!(call_sign = from, "Answer before our offer was sent");
                        return;
                    };
                    session.remote_description = Some(answer.clone());
                    (
                        channel,
                        generation,
                        std::mem::take(&mut session.buffered_candidates),
                    )
                }
                _ => {
                    debug!(call_sign = from, "Unexpected answer");
                    return;
                }
            }
        };

        if let Err(e) = channel.apply_answer(&answer).await {
            self.inner
                .fail(from, generation, RealmError::unreachable(from, e.to_string()));
            return;
        }
        apply_candidates(from, &channel, buffered).await;
    }

    async fn on_candidate(&self, from: &str, candidate: IceCandidate) {
        let channel = {
            let mut peers = self.inner.lock_peers();
            let Some(session) = peers.get_mut(from).and_then(|p| p.session.as_mut()) else {
                debug!(call_sign = from, "Candidate without a negotiation");
                return;
            };
            session.remote_candidates += 1;
            match (&session.channel, &session.remote_description) {
                (Some(channel), Some(_)) => Arc::clone(channel),
                _ => {
                    session.buffered_candidates.push(candidate);
                    return;
                }
            }
        };
        apply_candidates(from, &channel, vec![candidate]).await;
    }
}

async fn apply_candidates(from: &str, channel: &Arc<dyn PeerChannel>, candidates: Vec<IceCandidate>) {
    for candidate in candidates {
        if let Err(e) = channel.add_candidate(&candidate).await {
            debug!(call_sign = from, error = %e, "Candidate rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PublicAddressTracker;
    use crate::link::{read_frame, write_frame};
    use crate::negotiator::NoNegotiator;
    use tokio::net::TcpListener;

    fn manager(lookup_ms: u64, max_queued: usize) -> (ConnectionManager, mpsc::UnboundedReceiver<LinkEvent>) {
        let config = RealmConfig {
            call_sign: "alpha".into(),
            // Nothing listens here; every lookup goes unanswered.
            discovery_url: "ws://127.0.0.1:9".into(),
            peer_lookup_timeout_ms: lookup_ms,
            max_queued_frames: max_queued,
            ..RealmConfig::default()
        };
        let discovery =
            DiscoveryClient::new(&config, Arc::new(PublicAddressTracker::new(None, 4000)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager =
            ConnectionManager::new(&config, discovery, Arc::new(NoNegotiator), events_tx);
        manager.start();
        (manager, events_rx)
    }

    fn beam(n: u32) -> Frame {
        Frame::Beam {
            event_type: "tick".into(),
            payload: serde_json::json!(n),
            from: "alpha".into(),
        }
    }

    /// A connected socket pair: (ours, theirs).
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (ours, theirs) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (ours.unwrap().0, theirs.unwrap())
    }

    #[tokio::test]
    async fn test_offline_peer_fails_queued_sends() {
        let (manager, _events) = manager(100, 16);
        let mut changes = manager.state_changes();

        let err = manager.send("bravo", beam(1)).await.unwrap_err();
        assert!(matches!(err, RealmError::PeerUnreachable { ref call_sign, .. } if call_sign == "bravo"));
        assert_eq!(manager.peer_state("bravo"), Some(PeerState::Closed));

        let change = changes.recv().await.unwrap();
        assert_eq!((change.from, change.to), (PeerState::Idle, PeerState::Closed));
    }

    #[tokio::test]
    async fn test_queue_limit() {
        let (manager, _events) = manager(5_000, 2);
        let _a = manager.enqueue("bravo", beam(1)).unwrap();
        let _b = manager.enqueue("bravo", beam(2)).unwrap();
        assert!(matches!(
            manager.enqueue("bravo", beam(3)),
            Err(RealmError::QueueFull { capacity: 2, .. })
        ));
        assert_eq!(manager.peers()[0].queued, 2);
    }

    #[tokio::test]
    async fn test_inbound_link_flushes_queue_in_order() {
        let (manager, _events) = manager(5_000, 16);
        let receipts: Vec<_> = (1..=3)
            .map(|n| manager.enqueue("bravo", beam(n)).unwrap())
            .collect();
        assert_eq!(manager.peer_state("bravo"), Some(PeerState::Idle));

        let (ours, mut theirs) = socket_pair().await;
        manager.adopt_inbound("bravo", ours);

        for receipt in receipts {
            assert_eq!(receipt.await.unwrap(), Ok(()));
        }
        for n in 1..=3 {
            match read_frame(&mut theirs).await.unwrap() {
                Frame::Beam { payload, .. } => assert_eq!(payload, serde_json::json!(n)),
                other => panic!("Expected beam, got {other:?}"),
            }
        }

        let snapshot = &manager.peers()[0];
        assert_eq!(snapshot.state, PeerState::Connected);
        assert_eq!(snapshot.transport, Some(TransportKind::Direct));
        assert!(snapshot.connected_at.is_some());

        // Connected: goes straight out.
        manager.send("bravo", beam(4)).await.unwrap();
        assert!(matches!(read_frame(&mut theirs).await.unwrap(), Frame::Beam { .. }));
    }

    #[tokio::test]
    async fn test_direct_link_race_keeps_smaller_initiator() {
        let (manager, _events) = manager(5_000, 16);

        let (ours_b, _theirs_b) = socket_pair().await;
        manager.adopt_inbound("bravo", ours_b);
        let first = manager.peers()[0].link.unwrap();

        // Our own dial wins: "alpha" < "bravo".
        let (ours_a, _theirs_a) = socket_pair().await;
        manager.adopt_direct("bravo", ours_a, "alpha");
        let second = manager.peers()[0].link.unwrap();
        assert_ne!(first, second);

        // A later inbound dial from bravo loses against it.
        let (ours_c, _theirs_c) = socket_pair().await;
        manager.adopt_inbound("bravo", ours_c);
        assert_eq!(manager.peers()[0].link, Some(second));
    }

    #[tokio::test]
    async fn test_remote_close_marks_peer_closed() {
        let (manager, mut events) = manager(5_000, 16);
        let (ours, mut theirs) = socket_pair().await;
        manager.adopt_inbound("bravo", ours);

        write_frame(&mut theirs, &beam(9)).await.unwrap();
        let link_id = match events.recv().await.unwrap() {
            LinkEvent::Frame { link_id, .. } => link_id,
            other => panic!("Expected frame, got {other:?}"),
        };
        drop(theirs);

        match events.recv().await.unwrap() {
            LinkEvent::Closed { call_sign, link_id: closed } => {
                assert_eq!(closed, link_id);
                manager.link_closed(&call_sign, closed);
            }
            other => panic!("Expected close, got {other:?}"),
        }
        assert_eq!(manager.peer_state("bravo"), Some(PeerState::Closed));
        // A second close for the same link is ignored.
        manager.link_closed("bravo", link_id);
        assert_eq!(manager.peer_state("bravo"), Some(PeerState::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued() {
        let (manager, _events) = manager(5_000, 16);
        let receipt = manager.enqueue("bravo", beam(1)).unwrap();
        manager.shutdown();
        assert_eq!(receipt.await.unwrap(), Err(RealmError::NotRunning));
    }

    #[tokio::test]
    async fn test_losing_direct_link_keeps_delivering() {
        let (manager, mut events) = manager(5_000, 16);

        // Bravo dialed us first and may already have written onto that link.
        let (ours_b, mut theirs_b) = socket_pair().await;
        manager.adopt_inbound("bravo", ours_b);
        let losing = manager.peers()[0].link.unwrap();

        // Our own dial wins the tie-break and replaces it.
        let (ours_a, mut theirs_a) = socket_pair().await;
        manager.adopt_direct("bravo", ours_a, "alpha");
        let winning = manager.peers()[0].link.unwrap();
        assert_ne!(losing, winning);

        write_frame(&mut theirs_b, &beam(7)).await.unwrap();
        let route = match events.recv().await.unwrap() {
            LinkEvent::Frame {
                link_id,
                reply,
                frame,
                ..
            } => {
                assert_eq!(link_id, losing);
                assert_eq!(frame, beam(7));
                manager
                    .reply_route("bravo", link_id, &reply)
                    .expect("frames on a retiring link are routed")
            }
            other => panic!("Expected frame, got {other:?}"),
        };

        // Answers go out on the winning link.
        route.send(beam(8)).unwrap();
        assert_eq!(read_frame(&mut theirs_a).await.unwrap(), beam(8));

        // Our half of the losing link was shut after draining.
        assert!(read_frame(&mut theirs_b).await.is_err());
        drop(theirs_b);
        match events.recv().await.unwrap() {
            LinkEvent::Closed { call_sign, link_id } => {
                assert_eq!(link_id, losing);
                manager.link_closed(&call_sign, link_id);
            }
            other => panic!("Expected close, got {other:?}"),
        }

        assert!(manager.reply_route("bravo", losing, &route).is_none());
        assert_eq!(manager.peer_state("bravo"), Some(PeerState::Connected));
        assert_eq!(manager.peers()[0].link, Some(winning));
    }

    #[tokio::test]
    async fn test_no_links_adopted_after_shutdown() {
        let (manager, _events) = manager(5_000, 16);
        manager.shutdown();

        let (ours, mut theirs) = socket_pair().await;
        manager.adopt_inbound("mallory", ours);
        assert_eq!(manager.peer_state("mallory"), None);
        assert!(read_frame(&mut theirs).await.is_err());
    }
}
