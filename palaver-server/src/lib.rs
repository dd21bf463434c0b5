//! Replicated group-chat server.
//!
//! Each process is one replica: it serves clients directly, stores group
//! messages in causal order, and gossips updates to every configured peer
//! until all replicas converge on the same order.

pub mod clock;
pub mod config;
pub mod liveness;
pub mod msgid;
pub mod net;
pub mod node;
pub mod proto;
pub mod replication;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;
