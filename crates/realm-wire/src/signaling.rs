//! Signaling relay: carries negotiation payloads between two peers through
//! the rendezvous service. Payloads are opaque here.

use crate::discovery::DiscoveryClient;
use crate::message::{Frame, IceCandidate, SessionDescription};

use realm_types::RealmResult;
use std::sync::Arc;
use tracing::debug;

/// An inbound signaling message addressed to this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub from: String,
    pub sdp: Option<SessionDescription>,
    pub candidate: Option<IceCandidate>,
}

#[derive(Clone)]
pub struct SignalingRelay {
    local: String,
    discovery: DiscoveryClient,
}

impl SignalingRelay {
    pub fn new(discovery: DiscoveryClient) -> Self {
        Self {
            local: discovery.call_sign().to_string(),
            discovery,
        }
    }

    pub fn send_offer(&self, target: &str, offer: SessionDescription) -> RealmResult<()> {
        self.forward(target, Some(offer), None)
    }

    pub fn send_answer(&self, target: &str, answer: SessionDescription) -> RealmResult<()> {
        self.forward(target, Some(answer), None)
    }

    pub fn send_candidate(&self, target: &str, candidate: IceCandidate) -> RealmResult<()> {
        self.forward(target, None, Some(candidate))
    }

    /// Deliver every inbound signal addressed to us to `handler`.
    pub fn on_signal<F>(&self, handler: F)
    where
        F: Fn(SignalMessage) + Send + Sync + 'static,
    {
        let local = self.local.clone();
        self.discovery.set_signal_handler(Arc::new(move |frame| {
            let Frame::Signal {
                to,
                from,
                sdp,
                candidate,
            } = frame
            else {
                return;
            };
            if to != local {
                debug!(to = %to, from = %from, "Dropping signal addressed elsewhere");
                return;
            }
            if sdp.is_none() && candidate.is_none() {
                debug!(from = %from, "Dropping empty signal");
                return;
            }
            handler(SignalMessage {
                from,
                sdp,
                candidate,
            });
        }));
    }

    fn forward(
        &self,
        target: &str,
        sdp: Option<SessionDescription>,
        candidate: Option<IceCandidate>,
    ) -> RealmResult<()> {
        self.discovery.send(Frame::Signal {
            to: target.to_string(),
            from: self.local.clone(),
            sdp,
            candidate,
        })
    }
}
