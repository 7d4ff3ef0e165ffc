//! The Realm: one instance's view of the peer network.
//!
//! A [`Realm`] owns the discovery client, connection manager, router and
//! pending-query table for one call sign. Nothing is global, so several
//! realms can share a process.

use crate::address::{AddressSource, HttpAddressSource, PublicAddressTracker, StaticAddressSource};
use crate::connection::{ConnectionManager, PeerSnapshot, StateChange};
use crate::discovery::DiscoveryClient;
use crate::link::LinkEvent;
use crate::message::Frame;
use crate::negotiator::ChannelNegotiator;
use crate::pending::{PendingReceiver, PendingTable};
use crate::router::{BeamEvent, HandlerError, MessageRouter, QueryRequest, Scope, SubscriptionId};
use crate::server::LocalTransportServer;

use realm_types::{RealmConfig, RealmError, RealmResult};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Builder for [`Realm`]; lets tests and embedders swap the negotiator and
/// address source.
pub struct RealmBuilder {
    config: RealmConfig,
    negotiator: Option<Arc<dyn ChannelNegotiator>>,
    address_source: Option<Box<dyn AddressSource>>,
}

impl RealmBuilder {
    /// Use `negotiator` for the negotiated-channel fallback.
    pub fn negotiator(mut self, negotiator: Arc<dyn ChannelNegotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Resolve the advertised host from `source` instead of the configuration.
    pub fn address_source(mut self, source: Box<dyn AddressSource>) -> Self {
        self.address_source = Some(source);
        self
    }

    pub fn build(self) -> RealmResult<Realm> {
        let config = self.config;
        config.validate()?;

        let source = self.address_source.or_else(|| default_address_source(&config));
        let tracker = Arc::new(PublicAddressTracker::new(source, config.listen_addr.port()));
        let negotiator = self
            .negotiator
            .unwrap_or_else(|| default_negotiator(&config));

        let discovery = DiscoveryClient::new(&config, Arc::clone(&tracker));
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(&config, discovery.clone(), negotiator, link_tx);
        let pending = PendingTable::new(config.max_pending_queries);
        let router = MessageRouter::new(config.call_sign.clone(), pending.clone());

        Ok(Realm {
            inner: Arc::new(RealmInner {
                config,
                tracker,
                discovery,
                manager,
                router,
                pending,
                link_events: Mutex::new(Some(link_rx)),
                server: Mutex::new(None),
                dispatcher: Mutex::new(None),
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
        })
    }
}

fn default_address_source(config: &RealmConfig) -> Option<Box<dyn AddressSource>> {
    if let Some(host) = &config.advertise_host {
        return Some(Box::new(StaticAddressSource(host.clone())));
    }
    config
        .public_address_url
        .as_ref()
        .map(|url| Box::new(HttpAddressSource::new(url.clone())) as Box<dyn AddressSource>)
}

#[cfg(feature = "webrtc")]
fn default_negotiator(config: &RealmConfig) -> Arc<dyn ChannelNegotiator> {
    Arc::new(crate::webrtc_channel::WebRtcNegotiator::new(config))
}

#[cfg(not(feature = "webrtc"))]
fn default_negotiator(_config: &RealmConfig) -> Arc<dyn ChannelNegotiator> {
    Arc::new(crate::negotiator::NoNegotiator)
}

struct RealmInner {
    config: RealmConfig,
    tracker: Arc<PublicAddressTracker>,
    discovery: DiscoveryClient,
    manager: ConnectionManager,
    router: MessageRouter,
    pending: PendingTable<Value>,
    link_events: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    server: Mutex<Option<LocalTransportServer>>,
    dispatcher: Mutex<Option<AbortHandle>>,
    started: AtomicBool,
    running: AtomicBool,
}

/// An outstanding query. Await [`QueryHandle::response`] for the answer.
pub struct QueryHandle {
    request_id: String,
    rx: PendingReceiver<Value>,
}

impl QueryHandle {
    /// Correlation id, usable with [`Realm::cancel_query`].
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn response(self) -> RealmResult<Value> {
        let request_id = self.request_id;
        self.rx
            .await
            .unwrap_or_else(|_| Err(RealmError::Cancelled(request_id)))
    }
}

/// One Realm instance. Cheap to clone.
#[derive(Clone)]
pub struct Realm {
    inner: Arc<RealmInner>,
}

impl Realm {
    pub fn builder(config: RealmConfig) -> RealmBuilder {
        RealmBuilder {
            config,
            negotiator: None,
            address_source: None,
        }
    }

    /// Build with the default negotiator and address source.
    pub fn new(config: RealmConfig) -> RealmResult<Self> {
        Self::builder(config).build()
    }

    /// Bind the direct-socket listener, start routing and connect to the
    /// rendezvous service. A realm starts once; after `stop` build a new one.
    pub async fn start(&self) -> RealmResult<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(RealmError::Protocol("realm already started".into()));
        }

        let server = match LocalTransportServer::bind(
            inner.config.listen_addr,
            inner.manager.clone(),
            inner.config.direct_connect_timeout(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        inner.tracker.set_port(server.local_addr().port());
        *inner.server.lock().unwrap_or_else(|e| e.into_inner()) = Some(server);

        inner.manager.start();
        if let Some(events) = inner
            .link_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let task = tokio::spawn(dispatch(
                events,
                inner.manager.clone(),
                inner.router.clone(),
            ));
            *inner.dispatcher.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(task.abort_handle());
        }

        inner.discovery.start().await;
        inner.running.store(true, Ordering::SeqCst);
        info!(call_sign = %inner.config.call_sign, "Realm started");
        Ok(())
    }

    /// Shut everything down. Queued sends and pending queries fail with
    /// `NotRunning`.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        inner.discovery.stop();
        if let Some(server) = inner.server.lock().unwrap_or_else(|e| e.into_inner()).take() {
            server.stop();
        }
        inner.manager.shutdown();
        inner.pending.reject_all(RealmError::NotRunning);
        if let Some(task) = inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        info!(call_sign = %inner.config.call_sign, "Realm stopped");
    }

    pub fn call_sign(&self) -> &str {
        &self.inner.config.call_sign
    }

    pub fn config(&self) -> &RealmConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Bound address of the direct-socket listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(LocalTransportServer::local_addr)
    }

    pub fn discovery(&self) -> &DiscoveryClient {
        &self.inner.discovery
    }

    /// Send a fire-and-forget event. Resolves once the frame reaches a
    /// transport.
    pub async fn beam(&self, target: &str, event_type: &str, payload: Value) -> RealmResult<()> {
        self.check_target(target)?;
        let frame = Frame::Beam {
            event_type: event_type.to_string(),
            payload,
            from: self.inner.config.call_sign.clone(),
        };
        self.inner.manager.send(target, frame).await
    }

    /// Send a query and return a handle to its eventual response.
    ///
    /// The frame is queued before this returns, so it keeps its order with
    /// respect to other sends to the same peer.
    pub fn start_query(
        &self,
        target: &str,
        query_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> RealmResult<QueryHandle> {
        self.check_target(target)?;
        let inner = &self.inner;
        let timeout = timeout.unwrap_or_else(|| inner.config.default_query_timeout());
        let (request_id, rx) = inner.pending.create(target, timeout)?;

        let frame = Frame::Query {
            query_type: query_type.to_string(),
            payload,
            request_id: request_id.clone(),
            from: inner.config.call_sign.clone(),
        };
        let delivery = match inner.manager.enqueue(target, frame) {
            Ok(delivery) => delivery,
            Err(e) => {
                inner.pending.reject(&request_id, e.clone());
                return Err(e);
            }
        };

        let pending = inner.pending.clone();
        let id = request_id.clone();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    pending.reject(&id, e);
                }
                Err(_) => {
                    pending.reject(&id, RealmError::Cancelled(id.clone()));
                }
            }
        });

        Ok(QueryHandle { request_id, rx })
    }

    /// Send a query and wait for the response, the timeout, or a failure to
    /// reach the peer, whichever comes first.
    pub async fn query(
        &self,
        target: &str,
        query_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> RealmResult<Value> {
        self.start_query(target, query_type, payload, timeout)?
            .response()
            .await
    }

    /// Cancel an outstanding query. A late response is then ignored.
    pub fn cancel_query(&self, request_id: &str) -> bool {
        self.inner.pending.cancel(request_id)
    }

    pub fn pending_queries(&self) -> usize {
        self.inner.pending.len()
    }

    /// Subscribe to beams of `event_type` from `scope`.
    pub fn on<F>(&self, scope: Scope, event_type: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&BeamEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.router.on(scope, event_type, callback)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.router.off(id)
    }

    /// Answer queries of `query_type` with `handler`.
    pub fn on_query<F, Fut>(&self, query_type: &str, handler: F)
    where
        F: Fn(QueryRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.inner.router.on_query(query_type, handler)
    }

    pub fn off_query(&self, query_type: &str) -> bool {
        self.inner.router.off_query(query_type)
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.inner.manager.peers()
    }

    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.inner.manager.state_changes()
    }

    fn check_target(&self, target: &str) -> RealmResult<()> {
        if !self.is_running() {
            return Err(RealmError::NotRunning);
        }
        if target.trim().is_empty() {
            return Err(RealmError::InvalidCallSign(target.to_string()));
        }
        if target == self.inner.config.call_sign {
            return Err(RealmError::InvalidCallSign(format!(
                "{target} (cannot address self)"
            )));
        }
        Ok(())
    }
}

/// Single consumer of every link's inbound traffic.
async fn dispatch(
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    manager: ConnectionManager,
    router: MessageRouter,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Frame {
                call_sign,
                link_id,
                reply,
                frame,
            } => {
                let Some(reply) = manager.reply_route(&call_sign, link_id, &reply) else {
                    debug!(call_sign = %call_sign, link = link_id, kind = frame.kind(), "Dropping frame from stale link");
                    continue;
                };
                router.route(&call_sign, &reply, frame);
            }
            LinkEvent::Closed { call_sign, link_id } => {
                manager.link_closed(&call_sign, link_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PeerState;
    use crate::link::{read_frame, write_frame};
    use tokio::net::TcpStream;

    fn config(call_sign: &str) -> RealmConfig {
        RealmConfig {
            call_sign: call_sign.into(),
            discovery_url: "ws://127.0.0.1:9".into(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            public_address_url: None,
            peer_lookup_timeout_ms: 100,
            discovery_retry_ms: 50,
            ..RealmConfig::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            Realm::new(RealmConfig::default()),
            Err(RealmError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_misuse_fails_fast() {
        let realm = Realm::new(config("alpha")).unwrap();
        assert_eq!(
            realm.beam("bravo", "ping", Value::Null).await,
            Err(RealmError::NotRunning)
        );

        realm.start().await.unwrap();
        assert!(realm.local_addr().is_some());
        assert!(matches!(
            realm.beam("", "ping", Value::Null).await,
            Err(RealmError::InvalidCallSign(_))
        ));
        assert!(matches!(
            realm.start_query("alpha", "status", Value::Null, None),
            Err(RealmError::InvalidCallSign(_))
        ));
        assert!(realm.start().await.is_err());

        realm.stop();
        assert!(!realm.is_running());
        assert_eq!(
            realm.beam("bravo", "ping", Value::Null).await,
            Err(RealmError::NotRunning)
        );
    }

    #[tokio::test]
    async fn test_query_to_offline_peer_is_unreachable() {
        let realm = Realm::new(config("alpha")).unwrap();
        realm.start().await.unwrap();

        let err = realm
            .query("bravo", "status", Value::Null, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, RealmError::PeerUnreachable { .. }));
        assert_eq!(realm.pending_queries(), 0);
        realm.stop();
    }

    #[tokio::test]
    async fn test_cancel_query() {
        let mut cfg = config("alpha");
        cfg.peer_lookup_timeout_ms = 5_000;
        let realm = Realm::new(cfg).unwrap();
        realm.start().await.unwrap();

        let handle = realm
            .start_query("bravo", "status", Value::Null, None)
            .unwrap();
        let id = handle.request_id().to_string();
        assert!(realm.cancel_query(&id));
        assert!(!realm.cancel_query(&id));
        assert_eq!(handle.response().await, Err(RealmError::Cancelled(id)));
        realm.stop();
    }

    #[tokio::test]
    async fn test_stop_rejects_pending_queries() {
        let mut cfg = config("alpha");
        cfg.peer_lookup_timeout_ms = 5_000;
        let realm = Realm::new(cfg).unwrap();
        realm.start().await.unwrap();

        let handle = realm
            .start_query("bravo", "status", Value::Null, None)
            .unwrap();
        realm.stop();
        assert_eq!(handle.response().await, Err(RealmError::NotRunning));
    }

    #[tokio::test]
    async fn test_start_after_bind_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = config("alpha");
        cfg.listen_addr = taken.local_addr().unwrap();
        let realm = Realm::new(cfg).unwrap();

        assert!(matches!(realm.start().await, Err(RealmError::Io(_))));
        assert!(!realm.is_running());

        drop(taken);
        realm.start().await.unwrap();
        assert!(realm.is_running());
        realm.stop();
    }

    #[tokio::test]
    async fn test_handshake_finishing_after_stop_is_refused() {
        let realm = Realm::new(config("alpha")).unwrap();
        realm.start().await.unwrap();
        let addr = realm.local_addr().unwrap();

        // Accepted but still anonymous when the realm stops.
        let mut raw = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        realm.stop();

        let _ = write_frame(
            &mut raw,
            &Frame::Hello {
                call_sign: "mallory".into(),
            },
        )
        .await;
        let read = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut raw))
            .await
            .expect("socket left open after stop");
        assert!(read.is_err());
        assert!(realm
            .peers()
            .iter()
            .all(|p| p.call_sign != "mallory" || p.state != PeerState::Connected));
    }
}
