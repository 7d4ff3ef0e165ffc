//! Shared types for the Realm peer-to-peer communication layer.
//!
//! This crate defines configuration and error types used by the Realm core
//! and the rendezvous service. It contains no networking logic.

pub mod config;
pub mod error;

pub use config::{load_config, RealmConfig, TurnServer};
pub use error::{RealmError, RealmResult};
