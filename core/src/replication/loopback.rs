//! In-memory message bus: queues instead of sockets, drained explicitly.
//!
//! Deterministic by construction, which makes it the transport of choice
//! for tests and single-process hosts; nothing is delivered until a drain
//! call hands the queued messages over.

use std::{
	collections::{BTreeMap, VecDeque},
	sync::{Arc, Mutex, PoisonError},
};

use crate::replication::{
	client::ReplicationSender,
	proto::ReplicationMessage,
	server::{PeerId, ReplicationTransport},
};

#[derive(Default)]
struct Queues {
	to_server: VecDeque<(PeerId, ReplicationMessage)>,
	to_clients: BTreeMap<PeerId, VecDeque<ReplicationMessage>>,
}

/// A loopback bus connecting one server and any number of client peers.
#[derive(Default)]
pub struct LoopbackBus {
	queues: Mutex<Queues>,
}

impl LoopbackBus {
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::default()
	}

	/// Register a client peer so broadcasts start queueing for it.
	pub fn register_peer(&self, peer: PeerId) {
		self.queues().to_clients.entry(peer).or_default();
	}

	pub fn unregister_peer(&self, peer: PeerId) {
		self.queues().to_clients.remove(&peer);
	}

	/// The server's outbound endpoint.
	#[must_use]
	pub fn server_transport(self: &Arc<Self>) -> Arc<dyn ReplicationTransport> {
		Arc::new(ServerEnd {
			bus: Arc::clone(self),
		})
	}

	/// A client's outbound endpoint.
	#[must_use]
	pub fn client_sender(self: &Arc<Self>, peer: PeerId) -> Arc<dyn ReplicationSender> {
		Arc::new(ClientEnd {
			bus: Arc::clone(self),
			peer,
		})
	}

	/// Everything queued towards one client, in send order.
	#[must_use]
	pub fn drain_client(&self, peer: PeerId) -> Vec<ReplicationMessage> {
		self.queues()
			.to_clients
			.get_mut(&peer)
			.map(|queue| queue.drain(..).collect())
			.unwrap_or_default()
	}

	/// Everything queued towards the server, in send order.
	#[must_use]
	pub fn drain_server(&self) -> Vec<(PeerId, ReplicationMessage)> {
		self.queues().to_server.drain(..).collect()
	}

	fn queues(&self) -> std::sync::MutexGuard<'_, Queues> {
		self.queues.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

struct ServerEnd {
	bus: Arc<LoopbackBus>,
}

impl ReplicationTransport for ServerEnd {
	fn broadcast(&self, message: ReplicationMessage) {
		let mut queues = self.bus.queues();
		for queue in queues.to_clients.values_mut() {
			queue.push_back(message.clone());
		}
	}

	fn send_to(&self, peer: PeerId, message: ReplicationMessage) {
		if let Some(queue) = self.bus.queues().to_clients.get_mut(&peer) {
			queue.push_back(message);
		}
	}
}

struct ClientEnd {
	bus: Arc<LoopbackBus>,
	peer: PeerId,
}

impl ReplicationSender for ClientEnd {
	fn send(&self, message: ReplicationMessage) {
		self.bus.queues().to_server.push_back((self.peer, message));
	}
}
