//! Registry replication: an authoritative server-side broadcaster and the
//! client-side mirrors it keeps consistent.

pub mod client;
pub mod loopback;
pub mod proto;
pub mod server;

pub use client::{MirrorListener, ReplicationClient, ReplicationSender};
pub use loopback::LoopbackBus;
pub use proto::{ReplicationMessage, SyncSnapshot, WireError};
pub use server::{PeerId, ReplicationServer, ReplicationTransport};
