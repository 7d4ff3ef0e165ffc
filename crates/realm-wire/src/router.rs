//! Message router: demultiplexes inbound peer frames.
//!
//! `beam` frames fan out to local subscribers, `query` frames run the
//! registered handler and answer on the link they arrived on, and `response`
//! frames settle the matching pending query. Subscriber and handler failures
//! (including panics) are logged and contained.

use crate::link::FrameSender;
use crate::message::Frame;
use crate::pending::PendingTable;

use futures::future::BoxFuture;
use futures::FutureExt;
use realm_types::RealmError;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Error type returned by subscribers and query handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Which senders a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Events from every peer.
    Any,
    /// Events from one call sign only.
    Peer(String),
}

impl Scope {
    pub fn peer(call_sign: impl Into<String>) -> Self {
        Scope::Peer(call_sign.into())
    }
}

/// Handle returned by [`MessageRouter::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A fire-and-forget event delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamEvent {
    pub from: String,
    pub event_type: String,
    pub payload: Value,
}

/// An inbound query handed to its handler.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub from: String,
    pub query_type: String,
    pub payload: Value,
}

type Subscriber = Arc<dyn Fn(&BeamEvent) -> Result<(), HandlerError> + Send + Sync>;
type QueryHandler =
    Arc<dyn Fn(QueryRequest) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    scope: Scope,
    event_type: String,
    callback: Subscriber,
}

/// Routes inbound frames to subscribers, handlers and pending queries.
#[derive(Clone)]
pub struct MessageRouter {
    local: String,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    handlers: Arc<RwLock<HashMap<String, QueryHandler>>>,
    pending: PendingTable<Value>,
    next_id: Arc<AtomicU64>,
}

impl MessageRouter {
    pub fn new(local: impl Into<String>, pending: PendingTable<Value>) -> Self {
        Self {
            local: local.into(),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribe to `event_type` beams within `scope`.
    pub fn on<F>(&self, scope: Scope, event_type: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&BeamEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscription {
                id,
                scope,
                event_type: event_type.to_string(),
                callback: Arc::new(callback),
            });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Register the handler for `query_type`, replacing any previous one.
    pub fn on_query<F, Fut>(&self, query_type: &str, handler: F)
    where
        F: Fn(QueryRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: QueryHandler = Arc::new(move |req| handler(req).boxed());
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(query_type.to_string(), handler);
    }

    /// Remove the handler for `query_type`.
    pub fn off_query(&self, query_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(query_type)
            .is_some()
    }

    /// Route one frame that arrived on `call_sign`'s current link.
    pub fn route(&self, call_sign: &str, reply: &FrameSender, frame: Frame) {
        match frame {
            Frame::Beam {
                event_type,
                payload,
                from,
            } => {
                if from != call_sign {
                    debug!(link_peer = call_sign, claimed = %from, "Beam sender differs from link peer");
                }
                self.dispatch_beam(&BeamEvent {
                    from: call_sign.to_string(),
                    event_type,
                    payload,
                });
            }
            Frame::Query {
                query_type,
                payload,
                request_id,
                from,
            } => {
                if from != call_sign {
                    debug!(link_peer = call_sign, claimed = %from, "Query sender differs from link peer");
                }
                self.dispatch_query(
                    QueryRequest {
                        from: call_sign.to_string(),
                        query_type,
                        payload,
                    },
                    request_id,
                    reply.clone(),
                );
            }
            Frame::Response {
                request_id,
                payload,
                error,
            } => {
                let outcome = match error {
                    Some(message) => Err(RealmError::Remote(message)),
                    None => Ok(payload.unwrap_or(Value::Null)),
                };
                if !self.pending.resolve_from(&request_id, call_sign, outcome) {
                    debug!(call_sign, request_id = %request_id, "Response matched no pending query");
                }
            }
            other => {
                warn!(call_sign, kind = other.kind(), "Protocol error: unexpected frame on peer link");
            }
        }
    }

    /// Synchronous fan-out. Each subscriber is isolated from the others.
    fn dispatch_beam(&self, event: &BeamEvent) {
        let callbacks: Vec<(SubscriptionId, Subscriber)> = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.event_type == event.event_type)
            .filter(|s| match &s.scope {
                Scope::Any => true,
                Scope::Peer(peer) => *peer == event.from,
            })
            .map(|s| (s.id, Arc::clone(&s.callback)))
            .collect();

        if callbacks.is_empty() {
            debug!(from = %event.from, event_type = %event.event_type, "No subscribers for beam");
            return;
        }
        for (id, callback) in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscription = id.0, event_type = %event.event_type, error = %e, "Subscriber failed");
                }
                Err(_) => {
                    warn!(subscription = id.0, event_type = %event.event_type, "Subscriber panicked");
                }
            }
        }
    }

    /// Run the handler on its own task and answer on `reply`.
    fn dispatch_query(&self, request: QueryRequest, request_id: String, reply: FrameSender) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.query_type)
            .cloned();
        let local = self.local.clone();

        tokio::spawn(async move {
            let query_type = request.query_type.clone();
            let from = request.from.clone();
            let (payload, error) = match handler {
                None => (
                    None,
                    Some(format!("no handler for query type '{query_type}'")),
                ),
                Some(handler) => match AssertUnwindSafe(handler(request)).catch_unwind().await {
                    Ok(Ok(value)) => (Some(value), None),
                    Ok(Err(e)) => (None, Some(e.to_string())),
                    Err(_) => {
                        warn!(query_type = %query_type, "Query handler panicked");
                        (None, Some("query handler panicked".to_string()))
                    }
                },
            };
            debug!(local = %local, to = %from, query_type = %query_type, ok = error.is_none(), "Answering query");
            if reply
                .send(Frame::Response {
                    request_id,
                    payload,
                    error,
                })
                .is_err()
            {
                debug!(to = %from, "Link closed before the response could be sent");
            }
        });
    }
}
