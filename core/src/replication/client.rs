//! Client half of registry replication: a read-only mirror of the server's
//! registry, kept consistent through incremental events and full snapshots.

use std::{
	collections::{BTreeMap, BTreeSet},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, PoisonError, RwLock,
	},
};

use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::{
	definition::InstrumentDefinition,
	registry::InstrumentRegistry,
	replication::proto::{ReplicationMessage, SyncSnapshot},
};

/// The client's outbound side of the message channel; everything goes to
/// the server.
pub trait ReplicationSender: Send + Sync {
	fn send(&self, message: ReplicationMessage);
}

/// Observes instruments appearing in and disappearing from the mirror.
pub trait MirrorListener: Send + Sync {
	fn instrument_added(&self, definition: &InstrumentDefinition);
	fn instrument_removed(&self, definition: &InstrumentDefinition);
}

#[derive(Default)]
struct Mirror {
	/// Keyed by `InstrumentDefinition::lookup_name`.
	instruments: BTreeMap<String, InstrumentDefinition>,
	reserved: BTreeSet<String>,
}

enum MirrorEvent {
	Added(InstrumentDefinition),
	Removed(InstrumentDefinition),
}

struct ClientInner {
	sender: Arc<dyn ReplicationSender>,
	/// Client-local process registry, folded into `find_global`.
	parent: Option<InstrumentRegistry>,
	mirror: RwLock<Mirror>,
	listeners: RwLock<Vec<Arc<dyn MirrorListener>>>,
	/// Completion token of the outstanding full sync, if any. One wire
	/// request per token, no matter how many callers await it.
	pending: Mutex<Option<watch::Sender<bool>>>,
	populated: AtomicBool,
}

/// A mirrored, read-only view of the authoritative registry.
#[derive(Clone)]
pub struct ReplicationClient {
	inner: Arc<ClientInner>,
}

impl ReplicationClient {
	pub fn new(
		sender: Arc<dyn ReplicationSender>,
		parent: Option<InstrumentRegistry>,
	) -> Self {
		Self {
			inner: Arc::new(ClientInner {
				sender,
				parent,
				mirror: RwLock::default(),
				listeners: RwLock::default(),
				pending: Mutex::new(None),
				populated: AtomicBool::new(false),
			}),
		}
	}

	pub fn subscribe(&self, listener: Arc<dyn MirrorListener>) {
		self.inner
			.listeners
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(listener);
	}

	/// Apply one message received from the server.
	#[instrument(skip_all)]
	pub fn apply(&self, message: ReplicationMessage) {
		match message {
			ReplicationMessage::InstrumentAdded(definition) => {
				let key = definition.lookup_name();
				let events = {
					let mut mirror = self.write_mirror();
					match mirror.instruments.get(&key) {
						Some(existing) if *existing == definition => Vec::new(),
						Some(existing) => {
							let removed = existing.clone();
							mirror.instruments.insert(key, definition.clone());
							vec![MirrorEvent::Removed(removed), MirrorEvent::Added(definition)]
						}
						None => {
							mirror.instruments.insert(key, definition.clone());
							vec![MirrorEvent::Added(definition)]
						}
					}
				};
				self.fire(events);
			}
			ReplicationMessage::InstrumentRemoved(definition) => {
				let removed = self
					.write_mirror()
					.instruments
					.remove(&definition.lookup_name());
				self.fire(removed.into_iter().map(MirrorEvent::Removed).collect());
			}
			ReplicationMessage::ReservedNameAdded(name) => {
				self.write_mirror().reserved.insert(name.to_lowercase());
			}
			ReplicationMessage::ReservedNameRemoved(name) => {
				self.write_mirror().reserved.remove(&name.to_lowercase());
			}
			ReplicationMessage::FullSyncSnapshot(snapshot) => {
				self.populate(snapshot);
			}
			ReplicationMessage::FullSyncRequest => {
				warn!("server-directed message reached the client, ignoring");
			}
		}
	}

	/// Replace the whole mirror from a snapshot, firing add/remove pairs
	/// only for entries that actually changed. Two identical snapshots in a
	/// row produce zero events. Returns whether this was the first
	/// population since the client was created.
	pub fn populate(&self, snapshot: SyncSnapshot) -> bool {
		let incoming = snapshot
			.instruments
			.into_iter()
			.map(|definition| (definition.lookup_name(), definition))
			.collect::<BTreeMap<_, _>>();

		let mut events = Vec::new();
		{
			let mut mirror = self.write_mirror();

			for (key, existing) in &mirror.instruments {
				if !incoming.contains_key(key) {
					events.push(MirrorEvent::Removed(existing.clone()));
				}
			}
			for (key, definition) in &incoming {
				match mirror.instruments.get(key) {
					Some(existing) if existing == definition => {}
					Some(existing) => {
						events.push(MirrorEvent::Removed(existing.clone()));
						events.push(MirrorEvent::Added(definition.clone()));
					}
					None => events.push(MirrorEvent::Added(definition.clone())),
				}
			}

			mirror.instruments = incoming;
			mirror.reserved = snapshot
				.reserved_names
				.into_iter()
				.map(|name| name.to_lowercase())
				.collect();
		}

		debug!(changes = events.len(), "applied full sync snapshot");
		self.fire(events);

		// Resolve the outstanding completion token, waking every awaiter.
		if let Some(token) = self
			.inner
			.pending
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
		{
			let _ = token.send_replace(true);
		}

		!self.inner.populated.swap(true, Ordering::AcqRel)
	}

	/// Ask the server for a full snapshot. A no-op while a sync is already
	/// outstanding.
	pub fn request_full_update(&self) {
		if self.ensure_pending().is_some() {
			self.inner.sender.send(ReplicationMessage::FullSyncRequest);
		}
	}

	/// Wait until the next full snapshot is applied. Concurrent callers
	/// coalesce onto the same in-flight completion token; exactly one wire
	/// request is issued for all of them.
	pub async fn await_full_update(&self) {
		let (issued, mut receiver) = {
			let mut pending = self
				.inner
				.pending
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			match &*pending {
				Some(token) => (false, token.subscribe()),
				None => {
					let (token, receiver) = watch::channel(false);
					*pending = Some(token);
					(true, receiver)
				}
			}
		};

		if issued {
			self.inner.sender.send(ReplicationMessage::FullSyncRequest);
		}

		// The sender side may already be gone once the value flipped; the
		// current value is checked first, so that is not an error path we
		// care about.
		let _ = receiver.wait_for(|done| *done).await;
	}

	/// Whether at least one snapshot was applied.
	#[must_use]
	pub fn is_populated(&self) -> bool {
		self.inner.populated.load(Ordering::Acquire)
	}

	/// Case-insensitive mirror lookup.
	#[must_use]
	pub fn get(&self, name: &str) -> Option<InstrumentDefinition> {
		self.read_mirror()
			.instruments
			.get(&name.to_lowercase())
			.cloned()
	}

	#[must_use]
	pub fn is_reserved(&self, name: &str) -> bool {
		self.read_mirror().reserved.contains(&name.to_lowercase())
	}

	#[must_use]
	pub fn reserved_names(&self) -> BTreeSet<String> {
		self.read_mirror().reserved.clone()
	}

	/// Mirrored instruments, optionally filtered by a name pattern.
	#[must_use]
	pub fn find_local(&self, pattern: Option<&Regex>) -> Vec<InstrumentDefinition> {
		self.read_mirror()
			.instruments
			.values()
			.filter(|definition| pattern.map_or(true, |p| p.is_match(definition.name())))
			.cloned()
			.collect()
	}

	/// Mirrored instruments plus the client-local registry's.
	#[must_use]
	pub fn find_global(&self, pattern: Option<&Regex>) -> Vec<InstrumentDefinition> {
		let mut found = self.find_local(pattern);
		if let Some(parent) = &self.inner.parent {
			found.extend(
				parent
					.find_global(pattern)
					.into_iter()
					.map(|registration| registration.definition().clone()),
			);
		}
		found
	}

	/// Ask the server to create an ad-hoc instrument. The mirror picks the
	/// instrument up through the server's own broadcast.
	pub fn request_instrument(&self, definition: InstrumentDefinition) {
		self.inner
			.sender
			.send(ReplicationMessage::InstrumentAdded(definition));
	}

	/// Ask the server to remove an ad-hoc instrument.
	pub fn request_instrument_removal(&self, definition: InstrumentDefinition) {
		self.inner
			.sender
			.send(ReplicationMessage::InstrumentRemoved(definition));
	}

	/// Install a fresh completion token if none is outstanding. Returns
	/// `Some` when this call created it (and the caller owns sending the
	/// wire request).
	fn ensure_pending(&self) -> Option<watch::Receiver<bool>> {
		let mut pending = self
			.inner
			.pending
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if pending.is_some() {
			return None;
		}
		let (token, receiver) = watch::channel(false);
		*pending = Some(token);
		Some(receiver)
	}

	fn fire(&self, events: Vec<MirrorEvent>) {
		if events.is_empty() {
			return;
		}
		let listeners = self
			.inner
			.listeners
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();
		for event in &events {
			for listener in &listeners {
				match event {
					MirrorEvent::Added(definition) => listener.instrument_added(definition),
					MirrorEvent::Removed(definition) => listener.instrument_removed(definition),
				}
			}
		}
	}

	fn read_mirror(&self) -> std::sync::RwLockReadGuard<'_, Mirror> {
		self.inner
			.mirror
			.read()
			.unwrap_or_else(PoisonError::into_inner)
	}

	fn write_mirror(&self) -> std::sync::RwLockWriteGuard<'_, Mirror> {
		self.inner
			.mirror
			.write()
			.unwrap_or_else(PoisonError::into_inner)
	}
}
