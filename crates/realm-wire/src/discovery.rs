//! Discovery client: the persistent link to the rendezvous service.
//!
//! Registers this instance's call sign and advertised address, keeps the
//! registration alive with heartbeats, answers "is this peer online?" lookups
//! and carries signaling frames in both directions. The service being
//! unreachable is never fatal: the client retries on a fixed delay forever and
//! lookups made meanwhile simply report the peer as offline.

use crate::address::{PublicAddress, PublicAddressTracker};
use crate::message::{from_json, to_json, Frame};
use crate::pending::PendingTable;

use futures::{SinkExt, StreamExt};
use realm_types::{RealmConfig, RealmError, RealmResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Upper bound on concurrent outstanding `getPeer` lookups.
const MAX_PENDING_LOOKUPS: usize = 1024;

/// What the rendezvous service knows about a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub online: bool,
    pub address: Option<String>,
}

impl PeerStatus {
    pub fn offline() -> Self {
        Self {
            online: false,
            address: None,
        }
    }
}

/// Callback receiving inbound `webrtc-signal` frames.
pub type SignalHandler = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Debug, Default)]
struct AddressState {
    /// Latest known advertised address.
    current: Option<String>,
    /// Address carried by the last `register`/`update` sent.
    registered: Option<String>,
}

struct DiscoveryInner {
    call_sign: String,
    url: String,
    token: Option<String>,
    retry: Duration,
    heartbeat_interval: Duration,
    lookup_timeout: Duration,
    tracker: Arc<PublicAddressTracker>,
    outbound: mpsc::UnboundedSender<Frame>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    lookups: PendingTable<PeerStatus>,
    address: Mutex<AddressState>,
    connected: AtomicBool,
    registered: AtomicBool,
    signal_handler: Mutex<Option<SignalHandler>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Client side of the rendezvous protocol. Cheap to clone.
#[derive(Clone)]
pub struct DiscoveryClient {
    inner: Arc<DiscoveryInner>,
}

impl DiscoveryClient {
    pub fn new(config: &RealmConfig, tracker: Arc<PublicAddressTracker>) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(DiscoveryInner {
                call_sign: config.call_sign.clone(),
                url: config.discovery_url.clone(),
                token: config.auth_token.clone(),
                retry: config.discovery_retry(),
                heartbeat_interval: config.heartbeat_interval(),
                lookup_timeout: config.peer_lookup_timeout(),
                tracker,
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                lookups: PendingTable::new(MAX_PENDING_LOOKUPS),
                address: Mutex::new(AddressState::default()),
                connected: AtomicBool::new(false),
                registered: AtomicBool::new(false),
                signal_handler: Mutex::new(None),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Resolve the public address once, then spawn the connection and
    /// heartbeat loops. Calling it twice is a no-op.
    pub async fn start(&self) {
        let Some(outbound_rx) = self
            .inner
            .outbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            debug!("Discovery client already started");
            return;
        };

        self.refresh_address().await;

        let connection = tokio::spawn(run_connection(Arc::clone(&self.inner), outbound_rx));
        let client = self.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.inner.heartbeat_interval);
            // The first tick fires immediately; registration already covers it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = client.heartbeat().await {
                    debug!(error = %e, "Heartbeat not sent");
                }
            }
        });

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(connection.abort_handle());
        tasks.push(heartbeat.abort_handle());
    }

    /// Stop both loops and close the rendezvous socket.
    pub fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        // The connection loop closes its socket on shutdown; only the
        // heartbeat ticker needs a hard stop.
        for task in tasks.iter().skip(1) {
            task.abort();
        }
        self.inner.lookups.reject_all(RealmError::NotRunning);
    }

    pub fn call_sign(&self) -> &str {
        &self.inner.call_sign
    }

    /// True while a rendezvous socket is open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// True once the service acknowledged the current registration.
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// The address carried by the most recent `register` or `update`.
    pub fn registered_address(&self) -> Option<String> {
        self.inner
            .address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .registered
            .clone()
    }

    /// Install the callback receiving inbound signaling frames.
    pub fn set_signal_handler(&self, handler: SignalHandler) {
        *self
            .inner
            .signal_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Queue a frame for the rendezvous service.
    ///
    /// Frames queued while disconnected go out after the next registration.
    pub fn send(&self, frame: Frame) -> RealmResult<()> {
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| RealmError::Discovery("discovery client stopped".into()))
    }

    /// Re-register with the current address.
    pub fn register(&self) -> RealmResult<()> {
        let frame = self.inner.registration_frame();
        self.send(frame)
    }

    /// One heartbeat tick: refresh the public address, then send `update` if
    /// it changed since the last registration, otherwise `heartbeat`.
    pub async fn heartbeat(&self) -> RealmResult<()> {
        self.refresh_address().await;
        if !self.is_connected() {
            return Err(RealmError::Discovery("not connected".into()));
        }
        let frame = {
            let mut address = self.inner.address.lock().unwrap_or_else(|e| e.into_inner());
            if address.current != address.registered {
                info!(
                    call_sign = %self.inner.call_sign,
                    address = ?address.current,
                    "Advertised address changed, re-registering"
                );
                address.registered = address.current.clone();
                Frame::Update {
                    call_sign: self.inner.call_sign.clone(),
                    address: address.current.clone(),
                }
            } else {
                Frame::Heartbeat {
                    call_sign: self.inner.call_sign.clone(),
                }
            }
        };
        self.send(frame)
    }

    /// Ask the service whether `call_sign` is online.
    ///
    /// Resolves `{online: false}` if no answer arrives within the lookup
    /// timeout or the client cannot send.
    pub async fn query_peer_status(&self, call_sign: &str) -> PeerStatus {
        let (request_id, rx) = match self.inner.lookups.create(call_sign, self.inner.lookup_timeout)
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!(call_sign, error = %e, "Peer lookup not started");
                return PeerStatus::offline();
            }
        };
        let frame = Frame::GetPeer {
            target: call_sign.to_string(),
            request_id: request_id.clone(),
        };
        if self.send(frame).is_err() {
            self.inner.lookups.cancel(&request_id);
            return PeerStatus::offline();
        }
        match rx.await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                debug!(call_sign, error = %e, "Peer lookup unanswered");
                PeerStatus::offline()
            }
            Err(_) => PeerStatus::offline(),
        }
    }

    async fn refresh_address(&self) {
        if let PublicAddress::Known(addr) = self.inner.tracker.resolve().await {
            self.inner
                .address
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .current = Some(addr);
        }
    }
}

impl DiscoveryInner {
    fn registration_frame(&self) -> Frame {
        let mut address = self.address.lock().unwrap_or_else(|e| e.into_inner());
        address.registered = address.current.clone();
        Frame::Register {
            call_sign: self.call_sign.clone(),
            address: address.current.clone(),
            token: self.token.clone(),
        }
    }

    fn handle_inbound(&self, bytes: &[u8]) {
        let frame = match from_json(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame from rendezvous service");
                return;
            }
        };
        match frame {
            Frame::Registered { call_sign } => {
                self.registered.store(true, Ordering::SeqCst);
                info!(call_sign = %call_sign, "Registered with rendezvous service");
            }
            Frame::PeerInfo {
                request_id,
                online,
                address,
            } => {
                self.lookups
                    .resolve(&request_id, PeerStatus { online, address });
            }
            signal @ Frame::Signal { .. } => {
                let handler = self
                    .signal_handler
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                match handler {
                    Some(handler) => handler(signal),
                    None => debug!("Dropping signal: no handler installed"),
                }
            }
            Frame::Error { message } => {
                warn!(message = %message, "Rendezvous service reported an error");
            }
            other => {
                debug!(kind = other.kind(), "Ignoring unexpected frame from rendezvous service");
            }
        }
    }
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

async fn send_frame(ws_tx: &mut WsSink, frame: &Frame) -> RealmResult<()> {
    let text = to_json(frame).map_err(|e| RealmError::Protocol(e.to_string()))?;
    ws_tx
        .send(Message::Text(text))
        .await
        .map_err(|e| RealmError::Discovery(e.to_string()))
}

/// Sleep for `delay`; returns true if shutdown was requested meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
        _ = shutdown_rx.changed() => true,
    }
}

async fn run_connection(inner: Arc<DiscoveryInner>, mut outbound: mpsc::UnboundedReceiver<Frame>) {
    let mut shutdown_rx = inner.shutdown.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        info!(url = %inner.url, "Connecting to rendezvous service");
        let ws_stream = match tokio_tungstenite::connect_async(inner.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(
                    "Rendezvous connection failed: {e}, retrying in {:?}",
                    inner.retry
                );
                if sleep_or_shutdown(inner.retry, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let register = inner.registration_frame();
        if let Err(e) = send_frame(&mut ws_tx, &register).await {
            warn!("Rendezvous registration send failed: {e}");
            if sleep_or_shutdown(inner.retry, &mut shutdown_rx).await {
                break;
            }
            continue;
        }
        inner.connected.store(true, Ordering::SeqCst);
        debug!(call_sign = %inner.call_sign, "Registration sent");

        // Returns true if we should reconnect
        let should_reconnect = 'inner: loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        break 'inner false;
                    };
                    if let Err(e) = send_frame(&mut ws_tx, &frame).await {
                        warn!(kind = frame.kind(), "Rendezvous send failed: {e}");
                        break 'inner true;
                    }
                }
                msg = ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            warn!("Rendezvous WebSocket error: {e}");
                            break 'inner true;
                        }
                        None => {
                            info!("Rendezvous WebSocket closed");
                            break 'inner true;
                        }
                    };
                    match msg {
                        Message::Text(text) => inner.handle_inbound(text.as_bytes()),
                        Message::Binary(bytes) => inner.handle_inbound(&bytes),
                        Message::Close(_) => {
                            info!("Rendezvous WebSocket closed by server");
                            break 'inner true;
                        }
                        _ => {}
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = ws_tx.close().await;
                        break 'inner false;
                    }
                }
            }
        };

        inner.connected.store(false, Ordering::SeqCst);
        inner.registered.store(false, Ordering::SeqCst);

        if !should_reconnect || *shutdown_rx.borrow() {
            break;
        }

        warn!("Rendezvous: reconnecting in {:?}", inner.retry);
        if sleep_or_shutdown(inner.retry, &mut shutdown_rx).await {
            break;
        }
    }

    info!("Discovery loop stopped");
}
