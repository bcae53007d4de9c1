//! GastroLog control plane: a strongly-typed configuration store
//! replicated by Raft.
//!
//! The pieces, bottom up:
//!
//! - [`model`] — typed entities keyed by time-ordered UUIDv7 identifiers;
//! - [`command`] / [`snapshot`] — the binary wire formats for replicated
//!   mutations and FSM compaction;
//! - [`store`] — the uniform CRUD contract with four interchangeable
//!   backends (in-memory, single-file JSON, embedded SQLite, Raft-backed);
//! - [`fsm`] — the deterministic state machine the Raft log folds into,
//!   including referential cascades and change notifications;
//! - [`raft`] — the openraft wiring and gRPC transport;
//! - [`auth`] — Argon2id password hashing, HMAC bearer tokens, and the
//!   fail-closed per-method RPC gate;
//! - [`bootstrap`] — first-boot seeding;
//! - [`rpc`] — the tonic services consumers talk to.
//!
//! Ingesters, storage engines, and query execution live elsewhere in the
//! platform; they consume this crate's [`store::Store`] reads and the
//! FSM's change notifications.

pub mod auth;
pub mod bootstrap;
pub mod command;
pub mod error;
pub mod fsm;
pub mod model;
pub mod node;
pub mod raft;
pub mod rpc;
pub mod settings;
pub mod snapshot;
pub mod store;
pub mod units;

pub use error::{Error, ErrorKind, Result};
