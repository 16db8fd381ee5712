//! Server half of registry replication: the authority that broadcasts its
//! registry to every connected peer.

use std::sync::Arc;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
	instrument::InstrumentRegistration,
	registry::{
		AvailabilityListener, AvailabilityPhase, InstrumentRegistry, ListenerHandle,
		RegistryError,
	},
	replication::proto::{ReplicationMessage, SyncSnapshot},
};

/// Identifies one connected peer on the message channel.
pub type PeerId = Uuid;

/// The outbound side of a reliable, ordered message channel. `broadcast`
/// and `send_to` enqueue; delivery happens elsewhere. At-least-once
/// delivery is fine, the messages are idempotent by construction.
pub trait ReplicationTransport: Send + Sync {
	fn broadcast(&self, message: ReplicationMessage);
	fn send_to(&self, peer: PeerId, message: ReplicationMessage);
}

/// Mirrors every post-mutation registry event onto the transport.
///
/// Mutable instruments are the kind this protocol mirrors in full; anything
/// else only occupies its name on clients, as a reserved name.
struct BroadcastListener {
	transport: Arc<dyn ReplicationTransport>,
}

impl BroadcastListener {
	fn message_for(
		instrument: &InstrumentRegistration,
		added: bool,
	) -> ReplicationMessage {
		if instrument.is_mutable() {
			let definition = instrument.definition().clone();
			if added {
				ReplicationMessage::InstrumentAdded(definition)
			} else {
				ReplicationMessage::InstrumentRemoved(definition)
			}
		} else {
			let name = instrument.definition().name().to_owned();
			if added {
				ReplicationMessage::ReservedNameAdded(name)
			} else {
				ReplicationMessage::ReservedNameRemoved(name)
			}
		}
	}
}

impl AvailabilityListener for BroadcastListener {
	fn instrument_added(&self, phase: AvailabilityPhase, instrument: &InstrumentRegistration) {
		if phase == AvailabilityPhase::Post {
			self.transport.broadcast(Self::message_for(instrument, true));
		}
	}

	fn instrument_removed(&self, phase: AvailabilityPhase, instrument: &InstrumentRegistration) {
		if phase == AvailabilityPhase::Post {
			self.transport
				.broadcast(Self::message_for(instrument, false));
		}
	}
}

/// Owns the canonical registry's replication duties.
pub struct ReplicationServer {
	registry: InstrumentRegistry,
	transport: Arc<dyn ReplicationTransport>,
	listener: Option<ListenerHandle>,
}

impl ReplicationServer {
	/// Attach to `registry`, broadcasting every add/remove from it and all
	/// registries chained below it.
	pub fn new(registry: InstrumentRegistry, transport: Arc<dyn ReplicationTransport>) -> Self {
		let listener = registry.subscribe_global(Arc::new(BroadcastListener {
			transport: Arc::clone(&transport),
		}));

		Self {
			registry,
			transport,
			listener: Some(listener),
		}
	}

	#[must_use]
	pub fn registry(&self) -> &InstrumentRegistry {
		&self.registry
	}

	/// Handle one message received from a peer.
	#[instrument(skip(self, message), fields(peer = %peer))]
	pub fn handle_message(&self, peer: PeerId, message: ReplicationMessage) {
		match message {
			ReplicationMessage::FullSyncRequest => {
				debug!("answering full sync request");
				self.transport
					.send_to(peer, ReplicationMessage::FullSyncSnapshot(self.snapshot()));
			}
			ReplicationMessage::InstrumentAdded(definition) => {
				// A user-requested ad-hoc instrument. Registering it fires
				// the broadcast listener, which mirrors it to every peer.
				match self.registry.register_definition(definition) {
					Ok(_) => {}
					Err(RegistryError::DuplicateInstrument { name, existing: _ }) => {
						debug!(name = %name, "requested instrument already registered");
					}
					Err(e) => warn!(?e, "failed to register requested instrument"),
				}
			}
			ReplicationMessage::InstrumentRemoved(definition) => {
				match self.registry.get_mutable(definition.name()) {
					Some(instrument) if *instrument.definition() == definition => {
						instrument.registration().close();
					}
					Some(_) => warn!(
						name = definition.name(),
						"removal request does not match the registered definition"
					),
					None => debug!(
						name = definition.name(),
						"removal request for unknown instrument"
					),
				}
			}
			other => {
				warn!(?other, "unexpected message from peer");
			}
		}
	}

	/// The full state a freshly connected or resyncing client needs.
	#[must_use]
	pub fn snapshot(&self) -> SyncSnapshot {
		let mut snapshot = SyncSnapshot {
			reserved_names: Default::default(),
			instruments: Vec::new(),
		};

		for registration in self.registry.find_local(None) {
			if registration.is_mutable() {
				snapshot.instruments.push(registration.definition().clone());
			} else {
				snapshot
					.reserved_names
					.insert(registration.definition().name().to_owned());
			}
		}

		snapshot
	}

	/// Stop broadcasting registry events.
	pub fn detach(mut self) {
		if let Some(listener) = self.listener.take() {
			listener.unsubscribe();
		}
	}
}
