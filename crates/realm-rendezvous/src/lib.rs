//! Realm rendezvous service.
//!
//! Keeps a registry of online call signs and the address each advertises,
//! answers `getPeer` lookups and relays `webrtc-signal` frames between
//! registered peers. One WebSocket per peer; a peer is online while its
//! socket is open and it has been heard from within the peer TTL.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use realm_wire::message::{from_json, to_json, Frame};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Service settings.
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub listen_addr: SocketAddr,
    /// Token peers must present on `register`. `None` accepts anyone.
    pub auth_token: Option<String>,
    /// Peers silent for longer than this are dropped from the registry.
    pub peer_ttl: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8787)),
            auth_token: None,
            peer_ttl: Duration::from_secs(90),
        }
    }
}

/// A registered peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub address: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    conn_id: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

type Registry = Arc<DashMap<String, PeerRecord>>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub struct RendezvousServer {
    local_addr: SocketAddr,
    registry: Registry,
    tasks: Vec<AbortHandle>,
}

impl RendezvousServer {
    /// Bind and start serving.
    pub async fn start(config: RendezvousConfig) -> Result<Self, RendezvousError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Rendezvous: listening on {}", local_addr);

        let registry: Registry = Arc::new(DashMap::new());
        let token = config.auth_token.map(Arc::new);
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&registry), token));
        let reaper = tokio::spawn(reap_loop(Arc::clone(&registry), config.peer_ttl));

        Ok(Self {
            local_addr,
            registry,
            tasks: vec![accept.abort_handle(), reaper.abort_handle()],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn is_online(&self, call_sign: &str) -> bool {
        self.registry.contains_key(call_sign)
    }

    pub fn peer(&self, call_sign: &str) -> Option<PeerRecord> {
        self.registry.get(call_sign).map(|r| r.clone())
    }

    pub fn online_count(&self) -> usize {
        self.registry.len()
    }

    /// Drop a peer's registration, as if it vanished. Its socket is closed on
    /// the next frame it sends.
    pub fn evict(&self, call_sign: &str) -> bool {
        self.registry.remove(call_sign).is_some()
    }

    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for RendezvousServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, registry: Registry, token: Option<Arc<String>>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Rendezvous: accepted connection from {}", addr);
                let registry = Arc::clone(&registry);
                let token = token.clone();
                tokio::spawn(async move {
                    handle_connection(stream, addr, registry, token).await;
                });
            }
            Err(e) => {
                error!("Rendezvous: accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn reap_loop(registry: Registry, ttl: Duration) {
    let period = (ttl / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return;
        };
        let cutoff = Utc::now() - ttl;
        registry.retain(|call_sign, record| {
            let alive = record.last_seen >= cutoff;
            if !alive {
                info!(call_sign = %call_sign, "Rendezvous: peer expired");
            }
            alive
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Registry,
    token: Option<Arc<String>>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Rendezvous: WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match to_json(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Rendezvous: failed to encode {}: {}", frame.kind(), e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let mut bound: Option<String> = None;

    while let Some(msg) = ws_rx.next().await {
        let bytes = match msg {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Rendezvous: read error from {}: {}", addr, e);
                break;
            }
        };
        let frame = match from_json(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Rendezvous: malformed frame from {}: {}", addr, e);
                let _ = tx.send(Frame::Error {
                    message: format!("malformed frame: {e}"),
                });
                continue;
            }
        };
        if !handle_frame(frame, conn_id, &mut bound, &tx, &registry, token.as_deref()) {
            break;
        }
        // The registry entry is how other peers reach this socket; once it is
        // evicted or taken over, this connection is done.
        if let Some(call_sign) = &bound {
            let current = registry
                .get(call_sign)
                .is_some_and(|r| r.conn_id == conn_id);
            if !current {
                info!(call_sign = %call_sign, "Rendezvous: registration superseded");
                bound = None;
                break;
            }
        }
    }

    if let Some(call_sign) = bound {
        if registry
            .remove_if(&call_sign, |_, r| r.conn_id == conn_id)
            .is_some()
        {
            info!(call_sign = %call_sign, "Rendezvous: peer disconnected");
        }
    }
    drop(tx);
    let _ = writer.await;
}

/// Apply one frame. Returns false if the connection should close.
fn handle_frame(
    frame: Frame,
    conn_id: u64,
    bound: &mut Option<String>,
    tx: &mpsc::UnboundedSender<Frame>,
    registry: &Registry,
    token: Option<&String>,
) -> bool {
    match frame {
        Frame::Register {
            call_sign,
            address,
            token: presented,
        } => {
            if call_sign.trim().is_empty() {
                let _ = tx.send(Frame::Error {
                    message: "call sign must not be empty".into(),
                });
                return true;
            }
            if let Some(expected) = token {
                if presented.as_deref() != Some(expected.as_str()) {
                    warn!(call_sign = %call_sign, "Rendezvous: registration rejected (bad token)");
                    let _ = tx.send(Frame::Error {
                        message: "invalid registration token".into(),
                    });
                    return false;
                }
            }
            if let Some(previous) = bound.as_ref().filter(|b| **b != call_sign) {
                registry.remove_if(previous, |_, r| r.conn_id == conn_id);
            }
            let now = Utc::now();
            info!(call_sign = %call_sign, address = ?address, "Rendezvous: peer registered");
            registry.insert(
                call_sign.clone(),
                PeerRecord {
                    address,
                    registered_at: now,
                    last_seen: now,
                    conn_id,
                    tx: tx.clone(),
                },
            );
            *bound = Some(call_sign.clone());
            let _ = tx.send(Frame::Registered { call_sign });
        }
        Frame::Heartbeat { call_sign } => {
            if bound.as_deref() == Some(call_sign.as_str()) {
                if let Some(mut record) = registry.get_mut(&call_sign) {
                    record.last_seen = Utc::now();
                }
            } else {
                debug!(call_sign = %call_sign, "Rendezvous: heartbeat for unbound call sign");
            }
        }
        Frame::Update { call_sign, address } => {
            if bound.as_deref() != Some(call_sign.as_str()) {
                let _ = tx.send(Frame::Error {
                    message: format!("{call_sign} is not registered on this connection"),
                });
                return true;
            }
            if let Some(mut record) = registry.get_mut(&call_sign) {
                info!(call_sign = %call_sign, address = ?address, "Rendezvous: address updated");
                record.address = address;
                record.last_seen = Utc::now();
            }
        }
        Frame::GetPeer { target, request_id } => {
            let (online, address) = match registry.get(&target) {
                Some(record) => (true, record.address.clone()),
                None => (false, None),
            };
            let _ = tx.send(Frame::PeerInfo {
                request_id,
                online,
                address,
            });
        }
        Frame::Signal {
            to,
            from,
            sdp,
            candidate,
        } => {
            if bound.as_deref() != Some(from.as_str()) {
                let _ = tx.send(Frame::Error {
                    message: "signal sender does not match registration".into(),
                });
                return true;
            }
            let delivered = registry
                .get(&to)
                .map(|record| {
                    record
                        .tx
                        .send(Frame::Signal {
                            to: to.clone(),
                            from,
                            sdp,
                            candidate,
                        })
                        .is_ok()
                })
                .unwrap_or(false);
            if !delivered {
                let _ = tx.send(Frame::Error {
                    message: format!("peer {to} is offline"),
                });
            }
        }
        other => {
            let _ = tx.send(Frame::Error {
                message: format!("unexpected frame: {}", other.kind()),
            });
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use realm_wire::message::SessionDescription;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn server() -> RendezvousServer {
        RendezvousServer::start(RendezvousConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..RendezvousConfig::default()
        })
        .await
        .unwrap()
    }

    async fn client(server: &RendezvousServer) -> Client {
        connect_async(server.url()).await.unwrap().0
    }

    async fn send(ws: &mut Client, frame: Frame) {
        ws.send(Message::Text(to_json(&frame).unwrap())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> Frame {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return from_json(text.as_bytes()).unwrap(),
                Ok(Some(Ok(_))) => continue,
                other => panic!("No frame: {other:?}"),
            }
        }
    }

    async fn register(ws: &mut Client, call_sign: &str, address: Option<&str>) {
        send(
            ws,
            Frame::Register {
                call_sign: call_sign.into(),
                address: address.map(str::to_string),
                token: None,
            },
        )
        .await;
        assert_eq!(
            recv(ws).await,
            Frame::Registered {
                call_sign: call_sign.into()
            }
        );
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let server = server().await;
        let mut alpha = client(&server).await;
        register(&mut alpha, "alpha", Some("10.0.0.1:4000")).await;

        let mut bravo = client(&server).await;
        send(
            &mut bravo,
            Frame::GetPeer {
                target: "alpha".into(),
                request_id: "r1".into(),
            },
        )
        .await;
        assert_eq!(
            recv(&mut bravo).await,
            Frame::PeerInfo {
                request_id: "r1".into(),
                online: true,
                address: Some("10.0.0.1:4000".into()),
            }
        );

        send(
            &mut bravo,
            Frame::GetPeer {
                target: "ghost".into(),
                request_id: "r2".into(),
            },
        )
        .await;
        assert!(matches!(
            recv(&mut bravo).await,
            Frame::PeerInfo { online: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_update_changes_address() {
        let server = server().await;
        let mut alpha = client(&server).await;
        register(&mut alpha, "alpha", Some("10.0.0.1:4000")).await;
        send(
            &mut alpha,
            Frame::Update {
                call_sign: "alpha".into(),
                address: Some("10.0.0.2:4000".into()),
            },
        )
        .await;
        // Round-trip a lookup so the update is known to be applied.
        send(
            &mut alpha,
            Frame::GetPeer {
                target: "alpha".into(),
                request_id: "r".into(),
            },
        )
        .await;
        assert!(matches!(
            recv(&mut alpha).await,
            Frame::PeerInfo { address: Some(ref a), .. } if a == "10.0.0.2:4000"
        ));
    }

    #[tokio::test]
    async fn test_signal_relay() {
        let server = server().await;
        let mut alpha = client(&server).await;
        let mut bravo = client(&server).await;
        register(&mut alpha, "alpha", None).await;
        register(&mut bravo, "bravo", None).await;

        let offer = Frame::Signal {
            to: "bravo".into(),
            from: "alpha".into(),
            sdp: Some(SessionDescription::offer("v=0")),
            candidate: None,
        };
        send(&mut alpha, offer.clone()).await;
        assert_eq!(recv(&mut bravo).await, offer);

        // Spoofed sender is refused.
        send(
            &mut alpha,
            Frame::Signal {
                to: "bravo".into(),
                from: "mallory".into(),
                sdp: Some(SessionDescription::offer("v=0")),
                candidate: None,
            },
        )
        .await;
        assert!(matches!(recv(&mut alpha).await, Frame::Error { .. }));

        // Offline target.
        send(
            &mut alpha,
            Frame::Signal {
                to: "charlie".into(),
                from: "alpha".into(),
                sdp: Some(SessionDescription::offer("v=0")),
                candidate: None,
            },
        )
        .await;
        assert!(matches!(
            recv(&mut alpha).await,
            Frame::Error { ref message } if message.contains("offline")
        ));
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let server = server().await;
        let mut alpha = client(&server).await;
        register(&mut alpha, "alpha", None).await;
        assert!(server.is_online("alpha"));

        alpha.close(None).await.unwrap();
        for _ in 0..50 {
            if !server.is_online("alpha") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!server.is_online("alpha"));
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let server = server().await;
        let mut alpha = client(&server).await;
        alpha
            .send(Message::Text("{\"type\":\"teleport\"}".into()))
            .await
            .unwrap();
        assert!(matches!(recv(&mut alpha).await, Frame::Error { .. }));
        register(&mut alpha, "alpha", None).await;
    }

    #[tokio::test]
    async fn test_token_required() {
        let server = RendezvousServer::start(RendezvousConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            auth_token: Some("s3cret".into()),
            ..RendezvousConfig::default()
        })
        .await
        .unwrap();
        let mut alpha = client(&server).await;
        send(
            &mut alpha,
            Frame::Register {
                call_sign: "alpha".into(),
                address: None,
                token: Some("wrong".into()),
            },
        )
        .await;
        assert!(matches!(recv(&mut alpha).await, Frame::Error { .. }));
        assert!(!server.is_online("alpha"));
    }

    #[tokio::test]
    async fn test_silent_peer_expires() {
        let server = RendezvousServer::start(RendezvousConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            peer_ttl: Duration::from_millis(150),
            ..RendezvousConfig::default()
        })
        .await
        .unwrap();
        let mut alpha = client(&server).await;
        register(&mut alpha, "alpha", None).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!server.is_online("alpha"));
    }
}
