//! Realm: peer-to-peer messaging between independently running instances.
//!
//! Instances find each other through a rendezvous service and talk over a
//! direct TCP socket when one side can reach the other, or over a negotiated
//! channel set up through the rendezvous service when neither can.
//!
//! ## Architecture
//!
//! - **DiscoveryClient**: WebSocket link to the rendezvous service (register,
//!   heartbeat, peer lookup, signaling transport)
//! - **PublicAddressTracker**: Resolves the address this instance advertises
//! - **LocalTransportServer**: Accepts direct sockets from peers
//! - **SignalingRelay**: Offer/answer/candidate exchange via the rendezvous service
//! - **ConnectionManager**: Per-peer transport state machine and outbound queues
//! - **MessageRouter**: Beam fan-out, query handlers, response correlation
//! - **PendingTable**: Outstanding request ids with timeouts
//! - **Realm**: Owns all of the above for one call sign

pub mod address;
pub mod connection;
pub mod discovery;
pub mod link;
pub mod message;
pub mod negotiator;
pub mod pending;
pub mod realm;
pub mod router;
pub mod server;
pub mod signaling;
#[cfg(feature = "webrtc")]
pub mod webrtc_channel;

pub use address::{AddressSource, PublicAddress, PublicAddressTracker};
pub use connection::{ConnectionManager, PeerSnapshot, PeerState, StateChange, TransportKind};
pub use discovery::{DiscoveryClient, PeerStatus};
pub use message::{Frame, IceCandidate, SessionDescription, WireError};
pub use negotiator::loopback::{LoopbackHub, LoopbackNegotiator};
pub use negotiator::{ChannelNegotiator, PeerChannel};
pub use pending::PendingTable;
pub use realm::{QueryHandle, Realm, RealmBuilder};
pub use router::{BeamEvent, HandlerError, QueryRequest, Scope, SubscriptionId};
pub use realm_types::{RealmConfig, RealmError, RealmResult};
