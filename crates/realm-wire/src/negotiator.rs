//! Negotiated peer channels.
//!
//! When a direct socket cannot be opened, two peers exchange an offer, an
//! answer and connectivity candidates through the rendezvous service until a
//! channel opens. [`ChannelNegotiator`] abstracts the machinery that produces
//! those descriptions and eventually a message pipe; the connection manager
//! owns all session state and never looks inside the payloads.

use crate::link::{next_link_id, FrameSender, LinkId};
use crate::message::{to_json, Frame, IceCandidate, SessionDescription};

use async_trait::async_trait;
use realm_types::RealmResult;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Event emitted by a negotiated channel while it is being set up or used.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A local connectivity candidate to forward to the remote side.
    LocalCandidate(IceCandidate),
    /// The channel is open; bytes sent here reach the remote peer.
    Open(mpsc::UnboundedSender<Vec<u8>>),
    /// One inbound message.
    Message(Vec<u8>),
    /// The channel failed or closed.
    Closed(String),
}

pub type ChannelEventSender = mpsc::UnboundedSender<ChannelEvent>;

/// One side of a channel under negotiation.
#[async_trait]
pub trait PeerChannel: Send + Sync + 'static {
    /// Apply the remote answer (offerer side only).
    async fn apply_answer(&self, answer: &SessionDescription) -> RealmResult<()>;

    /// Add a remote connectivity candidate.
    async fn add_candidate(&self, candidate: &IceCandidate) -> RealmResult<()>;

    /// Tear the channel down.
    async fn close(&self);
}

/// Produces negotiated channels.
#[async_trait]
pub trait ChannelNegotiator: Send + Sync + 'static {
    /// Start an outbound negotiation and return the local offer.
    async fn create_offer(
        &self,
        peer: &str,
        events: ChannelEventSender,
    ) -> RealmResult<(Arc<dyn PeerChannel>, SessionDescription)>;

    /// Accept a remote offer and return the local answer.
    async fn accept_offer(
        &self,
        peer: &str,
        offer: &SessionDescription,
        events: ChannelEventSender,
    ) -> RealmResult<(Arc<dyn PeerChannel>, SessionDescription)>;
}

/// An open negotiated channel bound to a peer.
pub struct NegotiatedLink {
    id: LinkId,
    tx: FrameSender,
    channel: Arc<dyn PeerChannel>,
    writer: AbortHandle,
    reader: Option<AbortHandle>,
}

impl std::fmt::Debug for NegotiatedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedLink").field("id", &self.id).finish()
    }
}

impl NegotiatedLink {
    /// Wrap an open channel pipe; frames are serialized one per message.
    pub fn spawn(
        call_sign: &str,
        channel: Arc<dyn PeerChannel>,
        pipe: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let id = next_link_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let peer = call_sign.to_string();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bytes = match to_json(&frame) {
                    Ok(json) => json.into_bytes(),
                    Err(e) => {
                        warn!(call_sign = %peer, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if pipe.send(bytes).is_err() {
                    debug!(call_sign = %peer, link = id, "Negotiated channel pipe closed");
                    break;
                }
            }
        });
        Self {
            id,
            tx,
            channel,
            writer: writer.abort_handle(),
            reader: None,
        }
    }

    /// Attach the task pumping this channel's inbound events, so `close`
    /// stops it too.
    pub fn with_reader(mut self, reader: AbortHandle) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Sender for frames on this link (used as the reply path).
    pub fn sender(&self) -> FrameSender {
        self.tx.clone()
    }

    pub fn send(&self, frame: Frame) -> Result<(), Frame> {
        self.tx.send(frame).map_err(|e| e.0)
    }

    pub fn close(self) {
        self.writer.abort();
        if let Some(reader) = self.reader {
            reader.abort();
        }
        let channel = self.channel;
        tokio::spawn(async move { channel.close().await });
    }
}

/// Negotiator used when no negotiated transport is available.
pub struct NoNegotiator;

#[async_trait]
impl ChannelNegotiator for NoNegotiator {
    async fn create_offer(
        &self,
        _peer: &str,
        _events: ChannelEventSender,
    ) -> RealmResult<(Arc<dyn PeerChannel>, SessionDescription)> {
        Err(realm_types::RealmError::Negotiation(
            "no negotiated transport available".into(),
        ))
    }

    async fn accept_offer(
        &self,
        _peer: &str,
        _offer: &SessionDescription,
        _events: ChannelEventSender,
    ) -> RealmResult<(Arc<dyn PeerChannel>, SessionDescription)> {
        Err(realm_types::RealmError::Negotiation(
            "no negotiated transport available".into(),
        ))
    }
}

pub mod loopback {
    //! In-process negotiated channels.
    //!
    //! Every Realm sharing one [`LoopbackHub`] can negotiate channels with
    //! the others. The offer carries a session token; the answer connects two
    //! in-memory pipes. Signaling still travels through the rendezvous
    //! service, so the full offer/answer/candidate exchange is exercised.

    use super::*;
    use realm_types::RealmError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Barrier;

    const OFFER_PREFIX: &str = "loopback-offer:";
    const ANSWER_PREFIX: &str = "loopback-answer:";

    struct Session {
        offered_to: String,
        offerer_events: ChannelEventSender,
        answerer_events: Option<ChannelEventSender>,
        /// Pipes handed to each side once the offerer applies the answer.
        offerer_pipe: Option<mpsc::UnboundedSender<Vec<u8>>>,
        answerer_pipe: Option<mpsc::UnboundedSender<Vec<u8>>>,
    }

    #[derive(Default)]
    struct HubInner {
        sessions: Mutex<HashMap<String, Session>>,
        refuse: AtomicBool,
        candidates_seen: AtomicUsize,
        offer_barrier: Mutex<Option<Arc<Barrier>>>,
        /// `(offerer, answerer)` for every accepted offer.
        pairings: Mutex<Vec<(String, String)>>,
    }

    /// Shared rendezvous point for loopback channels.
    #[derive(Clone, Default)]
    pub struct LoopbackHub {
        inner: Arc<HubInner>,
    }

    impl LoopbackHub {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent negotiation fail, as if no path existed.
        pub fn refuse_all(&self, refuse: bool) {
            self.inner.refuse.store(refuse, Ordering::SeqCst);
        }

        /// Number of remote candidates applied across all channels.
        pub fn candidates_seen(&self) -> usize {
            self.inner.candidates_seen.load(Ordering::SeqCst)
        }

        /// Hold every offer until `parties` offers are being created at once.
        pub fn sync_offers(&self, parties: usize) {
            *self
                .inner
                .offer_barrier
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(Barrier::new(parties)));
        }

        /// `(offerer, answerer)` call signs of every accepted offer, in order.
        pub fn pairings(&self) -> Vec<(String, String)> {
            self.inner
                .pairings
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }

        /// A negotiator bound to this hub.
        pub fn negotiator(&self) -> LoopbackNegotiator {
            LoopbackNegotiator { hub: self.clone() }
        }

        fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
            self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    /// Pump bytes from one side's pipe into the other side's events.
    fn bridge(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, to: ChannelEventSender) {
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if to.send(ChannelEvent::Message(bytes)).is_err() {
                    return;
                }
            }
            let _ = to.send(ChannelEvent::Closed("remote side closed".into()));
        });
    }

    pub struct LoopbackNegotiator {
        hub: LoopbackHub,
    }

    #[async_trait]
    impl ChannelNegotiator for LoopbackNegotiator {
        async fn create_offer(
            &self,
            peer: &str,
            events: ChannelEventSender,
        ) -> RealmResult<(Arc<dyn PeerChannel>, SessionDescription)> {
            if self.hub.inner.refuse.load(Ordering::SeqCst) {
                return Err(RealmError::Negotiation("loopback hub refused offer".into()));
            }
            let barrier = self
                .hub
                .inner
                .offer_barrier
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(barrier) = barrier {
                barrier.wait().await;
            }
            let token = uuid::Uuid::new_v4().to_string();
            let _ = events.send(ChannelEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:loopback 1 udp 1 127.0.0.1 0 typ host ({peer})"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
            self.hub.sessions().insert(
                token.clone(),
                Session {
                    offered_to: peer.to_string(),
                    offerer_events: events,
                    answerer_events: None,
                    offerer_pipe: None,
                    answerer_pipe: None,
                },
            );
            let channel = LoopbackChannel {
                hub: self.hub.clone(),
                token: token.clone(),
            };
            Ok((
                Arc::new(channel),
                SessionDescription::offer(format!("{OFFER_PREFIX}{token}")),
            ))
        }

        async fn accept_offer(
            &self,
            peer: &str,
            offer: &SessionDescription,
            events: ChannelEventSender,
        ) -> RealmResult<(Arc<dyn PeerChannel>, SessionDescription)> {
            if self.hub.inner.refuse.load(Ordering::SeqCst) {
                return Err(RealmError::Negotiation("loopback hub refused answer".into()));
            }
            let token = offer
                .sdp
                .strip_prefix(OFFER_PREFIX)
                .ok_or_else(|| RealmError::Negotiation("not a loopback offer".into()))?
                .to_string();

            let mut sessions = self.hub.sessions();
            let session = sessions
                .get_mut(&token)
                .ok_or_else(|| RealmError::Negotiation("unknown loopback session".into()))?;

            let (to_answerer, from_offerer) = mpsc::unbounded_channel::<Vec<u8>>();
            let (to_offerer, from_answerer) = mpsc::unbounded_channel::<Vec<u8>>();
            bridge(from_offerer, events.clone());
            bridge(from_answerer, session.offerer_events.clone());

            session.offerer_pipe = Some(to_answerer);
            session.answerer_pipe = Some(to_offerer);
            session.answerer_events = Some(events);
            self.hub
                .inner
                .pairings
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((peer.to_string(), session.offered_to.clone()));

            let channel = LoopbackChannel {
                hub: self.hub.clone(),
                token: token.clone(),
            };
            Ok((
                Arc::new(channel),
                SessionDescription::answer(format!("{ANSWER_PREFIX}{token}")),
            ))
        }
    }

    struct LoopbackChannel {
        hub: LoopbackHub,
        token: String,
    }

    #[async_trait]
    impl PeerChannel for LoopbackChannel {
        async fn apply_answer(&self, answer: &SessionDescription) -> RealmResult<()> {
            if answer.sdp.strip_prefix(ANSWER_PREFIX) != Some(self.token.as_str()) {
                return Err(RealmError::Negotiation("answer for another session".into()));
            }
            let mut sessions = self.hub.sessions();
            let session = sessions
                .get_mut(&self.token)
                .ok_or_else(|| RealmError::Negotiation("loopback session gone".into()))?;
            let (Some(offerer_pipe), Some(answerer_pipe)) =
                (session.offerer_pipe.take(), session.answerer_pipe.take())
            else {
                return Err(RealmError::Negotiation("answer applied twice".into()));
            };
            if let Some(answerer) = &session.answerer_events {
                let _ = answerer.send(ChannelEvent::Open(answerer_pipe));
            }
            let _ = session.offerer_events.send(ChannelEvent::Open(offerer_pipe));
            Ok(())
        }

        async fn add_candidate(&self, _candidate: &IceCandidate) -> RealmResult<()> {
            self.hub.inner.candidates_seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            if let Some(session) = self.hub.sessions().remove(&self.token) {
                let _ = session
                    .offerer_events
                    .send(ChannelEvent::Closed("channel closed".into()));
                if let Some(answerer) = session.answerer_events {
                    let _ = answerer.send(ChannelEvent::Closed("channel closed".into()));
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_loopback_pair_exchanges_bytes() {
            let hub = LoopbackHub::new();
            let negotiator = hub.negotiator();

            let (a_tx, mut a_rx) = mpsc::unbounded_channel();
            let (b_tx, mut b_rx) = mpsc::unbounded_channel();

            let (a_chan, offer) = negotiator.create_offer("bravo", a_tx).await.unwrap();
            assert!(matches!(
                a_rx.recv().await,
                Some(ChannelEvent::LocalCandidate(_))
            ));

            let (_b_chan, answer) = negotiator.accept_offer("alpha", &offer, b_tx).await.unwrap();
            assert!(b_rx.try_recv().is_err(), "answerer opened before the answer landed");
            assert_eq!(
                hub.pairings(),
                vec![("alpha".to_string(), "bravo".to_string())]
            );

            a_chan.apply_answer(&answer).await.unwrap();
            let b_pipe = match b_rx.recv().await {
                Some(ChannelEvent::Open(pipe)) => pipe,
                other => panic!("Expected Open, got {other:?}"),
            };
            let a_pipe = match a_rx.recv().await {
                Some(ChannelEvent::Open(pipe)) => pipe,
                other => panic!("Expected Open, got {other:?}"),
            };

            a_pipe.send(b"from-a".to_vec()).unwrap();
            b_pipe.send(b"from-b".to_vec()).unwrap();
            assert!(matches!(b_rx.recv().await, Some(ChannelEvent::Message(m)) if m == b"from-a"));
            assert!(matches!(a_rx.recv().await, Some(ChannelEvent::Message(m)) if m == b"from-b"));

            a_chan.close().await;
            assert!(matches!(b_rx.recv().await, Some(ChannelEvent::Closed(_))));
        }

        #[tokio::test]
        async fn test_refusing_hub() {
            let hub = LoopbackHub::new();
            hub.refuse_all(true);
            let (tx, _rx) = mpsc::unbounded_channel();
            assert!(hub.negotiator().create_offer("bravo", tx).await.is_err());
        }

        #[tokio::test]
        async fn test_answer_for_wrong_session_rejected() {
            let hub = LoopbackHub::new();
            let (tx, _rx) = mpsc::unbounded_channel();
            let (chan, _offer) = hub.negotiator().create_offer("bravo", tx).await.unwrap();
            let err = chan
                .apply_answer(&SessionDescription::answer("loopback-answer:other"))
                .await
                .unwrap_err();
            assert!(matches!(err, RealmError::Negotiation(_)));
        }
    }
}
