//! WebRTC data-channel negotiator (feature `webrtc`).
//!
//! The offerer creates the data channel; the answerer receives it through
//! `on_data_channel`. Candidates trickle through the signaling relay as they
//! are gathered. STUN/TURN servers come from [`RealmConfig`].

use crate::message::{IceCandidate, SdpKind, SessionDescription};
use crate::negotiator::{ChannelEvent, ChannelEventSender, ChannelNegotiator, PeerChannel};

use async_trait::async_trait;
use bytes::Bytes;
use realm_types::{RealmConfig, RealmError, RealmResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the single data channel carrying Realm frames.
pub const DATA_CHANNEL_LABEL: &str = "realm";

fn negotiation_error(e: webrtc::Error) -> RealmError {
    RealmError::Negotiation(e.to_string())
}

pub struct WebRtcNegotiator {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcNegotiator {
    pub fn new(config: &RealmConfig) -> Self {
        let mut ice_servers = Vec::new();
        if !config.stun_servers.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            });
        }
        for turn in &config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        Self {
            api: APIBuilder::new().build(),
            ice_servers,
        }
    }

    async fn peer_connection(
        &self,
        peer: &str,
        events: &ChannelEventSender,
    ) -> RealmResult<Arc<RTCPeerConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers.clone(),
                    ..Default::default()
                })
                .await
                .map_err(negotiation_error)?,
        );

        let candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates.send(ChannelEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => debug!(error = %e, "Could not serialize local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        let peer_name = peer.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_events = state_events.clone();
            let peer_name = peer_name.clone();
            Box::pin(async move {
                debug!(call_sign = %peer_name, state = %state, "Peer connection state");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    let _ = state_events.send(ChannelEvent::Closed(format!("peer connection {state}")));
                }
            })
        }));

        Ok(pc)
    }
}

/// Wire a data channel to the event stream.
fn bind_data_channel(dc: Arc<RTCDataChannel>, events: ChannelEventSender) {
    let inbound = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let inbound = inbound.clone();
        Box::pin(async move {
            let _ = inbound.send(ChannelEvent::Message(msg.data.to_vec()));
        })
    }));

    let closed = events.clone();
    dc.on_close(Box::new(move || {
        let closed = closed.clone();
        Box::pin(async move {
            let _ = closed.send(ChannelEvent::Closed("data channel closed".into()));
        })
    }));

    let writer_dc = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            info!(label = writer_dc.label(), "Data channel open");
            let (pipe, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
            let dc = Arc::clone(&writer_dc);
            tokio::spawn(async move {
                while let Some(bytes) = outbound.recv().await {
                    if let Err(e) = dc.send(&Bytes::from(bytes)).await {
                        debug!(error = %e, "Data channel send failed");
                        break;
                    }
                }
            });
            let _ = events.send(ChannelEvent::Open(pipe));
        })
    }));
}

fn to_rtc(description: &SessionDescription) -> RealmResult<RTCSessionDescription> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
    .map_err(negotiation_error)
}

#[async_trait]
impl ChannelNegotiator for WebRtcNegotiator {
    async fn create_offer(
        &self,
        peer: &str,
        events: ChannelEventSender,
    ) -> RealmResult<(Arc<dyn PeerChannel>, SessionDescription)> {
        let pc = self.peer_connection(peer, &events).await?;
        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(negotiation_error)?;
        bind_data_channel(dc, events);

        let offer = pc.create_offer(None).await.map_err(negotiation_error)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok((
            Arc::new(WebRtcChannel { pc }),
            SessionDescription::offer(offer.sdp),
        ))
    }

    async fn accept_offer(
        &self,
        peer: &str,
        offer: &SessionDescription,
        events: ChannelEventSender,
    ) -> RealmResult<(Arc<dyn PeerChannel>, SessionDescription)> {
        let pc = self.peer_connection(peer, &events).await?;
        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel_events = channel_events.clone();
            Box::pin(async move {
                if dc.label() == DATA_CHANNEL_LABEL {
                    bind_data_channel(dc, channel_events);
                } else {
                    debug!(label = dc.label(), "Ignoring unexpected data channel");
                }
            })
        }));

        pc.set_remote_description(to_rtc(offer)?)
            .await
            .map_err(negotiation_error)?;
        let answer = pc.create_answer(None).await.map_err(negotiation_error)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok((
            Arc::new(WebRtcChannel { pc }),
            SessionDescription::answer(answer.sdp),
        ))
    }
}

struct WebRtcChannel {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerChannel for WebRtcChannel {
    async fn apply_answer(&self, answer: &SessionDescription) -> RealmResult<()> {
        self.pc
            .set_remote_description(to_rtc(answer)?)
            .await
            .map_err(negotiation_error)
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> RealmResult<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(negotiation_error)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "Error closing peer connection");
        }
    }
}
