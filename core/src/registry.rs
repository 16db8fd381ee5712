//! The concurrent, name-keyed instrument registry.
//!
//! Registries can be chained: a world-scoped registry typically has a
//! process-scoped parent, and `find_global` walks the chain. Names are
//! unique case-insensitively within one registry.
//!
//! Availability listeners observe every add/remove twice: once in the `Pre`
//! phase, before the mutation is visible to concurrent lookups, and once in
//! the `Post` phase, after it is. Listeners must not register or close
//! instruments from inside a notification; registrations are serialized on
//! an internal (non-reentrant) mutation lock.

use std::{
	any::Any,
	collections::BTreeMap,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Mutex, PoisonError, RwLock, Weak,
	},
};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::{
	attribute::AttributeKey,
	config::PipelineConfig,
	definition::{DefinitionError, InstrumentDefinition, InstrumentKind},
	instrument::{
		Binding, GaugeCallback, GaugeRecorder, InstrumentRegistration, MutableInstrument,
		Registration,
	},
	persist::{self, PersistError, PersistenceStore},
};

const INSTRUMENT_KEY_PREFIX: &str = "instruments/";

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("instrument '{name}' is already registered")]
	DuplicateInstrument {
		name: String,
		existing: InstrumentDefinition,
	},
	#[error("registry has been shut down")]
	ShutDown,
	#[error(transparent)]
	Definition(#[from] DefinitionError),
	#[error(transparent)]
	Persist(#[from] PersistError),
}

/// Which side of the registry mutation a notification is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityPhase {
	Pre,
	Post,
}

/// Observes instruments appearing in and disappearing from a registry.
pub trait AvailabilityListener: Send + Sync {
	fn instrument_added(&self, phase: AvailabilityPhase, instrument: &InstrumentRegistration);
	fn instrument_removed(&self, phase: AvailabilityPhase, instrument: &InstrumentRegistration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerScope {
	/// Receives events from this registry and every registry below it.
	Global,
	/// Receives events from this registry only.
	Local,
}

#[derive(Default)]
struct ListenerSet {
	entries: RwLock<Vec<(u64, Arc<dyn AvailabilityListener>)>>,
	next_id: AtomicU64,
}

impl ListenerSet {
	fn add(&self, listener: Arc<dyn AvailabilityListener>) -> u64 {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.entries
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push((id, listener));
		id
	}

	fn remove(&self, id: u64) {
		self.entries
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.retain(|(entry_id, _)| *entry_id != id);
	}

	fn snapshot(&self) -> Vec<Arc<dyn AvailabilityListener>> {
		self.entries
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.map(|(_, listener)| Arc::clone(listener))
			.collect()
	}
}

/// Detaches an availability listener. Consuming, like
/// [`CallbackHandle`](crate::instrument::CallbackHandle).
#[derive(Debug)]
pub struct ListenerHandle {
	shared: Weak<RegistryShared>,
	scope: ListenerScope,
	id: u64,
}

impl ListenerHandle {
	pub fn unsubscribe(self) {
		if let Some(shared) = self.shared.upgrade() {
			let set = match self.scope {
				ListenerScope::Global => &shared.global_listeners,
				ListenerScope::Local => &shared.local_listeners,
			};
			set.remove(self.id);
		}
	}
}

/// Fluent definition of a gauge instrument, fed to one of the registry's
/// `register_*` operations.
#[derive(Debug, Clone)]
pub struct InstrumentBuilder {
	name: String,
	description: String,
	unit: String,
	kind: InstrumentKind,
	persistent: bool,
	attributes: Vec<AttributeKey>,
}

impl InstrumentBuilder {
	fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			description: String::new(),
			unit: String::new(),
			kind: InstrumentKind::Long,
			persistent: false,
			attributes: Vec::new(),
		}
	}

	#[must_use]
	pub fn description(mut self, description: impl Into<String>) -> Self {
		self.description = description.into();
		self
	}

	#[must_use]
	pub fn unit(mut self, unit: impl Into<String>) -> Self {
		self.unit = unit.into();
		self
	}

	#[must_use]
	pub fn kind(mut self, kind: InstrumentKind) -> Self {
		self.kind = kind;
		self
	}

	#[must_use]
	pub fn persistent(mut self, persistent: bool) -> Self {
		self.persistent = persistent;
		self
	}

	#[must_use]
	pub fn attribute(mut self, key: AttributeKey) -> Self {
		self.attributes.push(key);
		self
	}

	fn build(self, config: &PipelineConfig) -> Result<InstrumentDefinition, DefinitionError> {
		InstrumentDefinition::new(
			self.name,
			self.description,
			self.unit,
			self.kind,
			self.persistent,
			self.attributes,
			config,
		)
	}
}

pub(crate) struct RegistryShared {
	config: Arc<PipelineConfig>,
	store: Option<Arc<dyn PersistenceStore>>,
	parent: Option<InstrumentRegistry>,
	/// Serializes register/close so availability listeners observe a stable
	/// map in the `Pre` phase without holding the map lock across user code.
	mutation: Mutex<()>,
	instruments: RwLock<BTreeMap<String, Arc<Registration>>>,
	global_listeners: ListenerSet,
	local_listeners: ListenerSet,
	shut_down: AtomicBool,
}

/// Handle to a registry; clones share the same underlying store.
#[derive(Clone)]
pub struct InstrumentRegistry {
	shared: Arc<RegistryShared>,
}

impl InstrumentRegistry {
	/// A root registry with no persistence.
	#[must_use]
	pub fn new(config: Arc<PipelineConfig>) -> Self {
		Self::build(config, None, None)
	}

	/// A root registry that persists instrument definitions flagged
	/// persistent. Previously persisted definitions are re-registered (as
	/// mutable instruments with no callbacks) before the registry is
	/// returned, so they occupy their names from the first lookup on.
	pub fn open(
		config: Arc<PipelineConfig>,
		store: Arc<dyn PersistenceStore>,
	) -> Result<Self, RegistryError> {
		let registry = Self::build(config, Some(store), None);
		registry.load_persisted()?;
		Ok(registry)
	}

	/// A child registry chained under `self`; `find_global` on the child
	/// also yields the parent's instruments, and the parent's global
	/// listeners observe the child's events.
	#[must_use]
	pub fn child(&self) -> Self {
		Self::build(
			Arc::clone(&self.shared.config),
			self.shared.store.clone(),
			Some(self.clone()),
		)
	}

	fn build(
		config: Arc<PipelineConfig>,
		store: Option<Arc<dyn PersistenceStore>>,
		parent: Option<Self>,
	) -> Self {
		Self {
			shared: Arc::new(RegistryShared {
				config,
				store,
				parent,
				mutation: Mutex::new(()),
				instruments: RwLock::default(),
				global_listeners: ListenerSet::default(),
				local_listeners: ListenerSet::default(),
				shut_down: AtomicBool::new(false),
			}),
		}
	}

	#[must_use]
	pub fn config(&self) -> &PipelineConfig {
		&self.shared.config
	}

	/// Begin a gauge definition.
	#[must_use]
	pub fn gauge(&self, name: impl Into<String>) -> InstrumentBuilder {
		InstrumentBuilder::new(name)
	}

	/// Register an instrument backed by one fixed callback.
	pub fn register_immutable(
		&self,
		builder: InstrumentBuilder,
		callback: impl GaugeCallback,
	) -> Result<InstrumentRegistration, RegistryError> {
		let definition = builder.build(&self.shared.config)?;
		let registration =
			self.shared
				.insert(definition, Binding::Immutable(Arc::new(callback)))?;
		Ok(InstrumentRegistration::from_arc(&registration))
	}

	/// Register an instrument accepting externally attached callbacks.
	pub fn register_mutable(
		&self,
		builder: InstrumentBuilder,
	) -> Result<MutableInstrument, RegistryError> {
		let definition = builder.build(&self.shared.config)?;
		self.register_definition(definition)
	}

	/// Register an already-validated definition as a mutable instrument.
	/// Used when a definition arrives whole, e.g. over the wire.
	pub fn register_definition(
		&self,
		definition: InstrumentDefinition,
	) -> Result<MutableInstrument, RegistryError> {
		let registration = self
			.shared
			.insert(definition, Binding::Mutable(Mutex::default()))?;
		Ok(MutableInstrument::from_arc(&registration))
	}

	/// This registry's own instruments, optionally filtered by a name
	/// pattern. `None` means all.
	#[must_use]
	pub fn find_local(&self, pattern: Option<&Regex>) -> Vec<InstrumentRegistration> {
		self.shared
			.instruments
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.values()
			.filter(|registration| {
				pattern.map_or(true, |p| p.is_match(registration.definition.name()))
			})
			.map(InstrumentRegistration::from_arc)
			.collect()
	}

	/// This registry's instruments plus every ancestor's.
	#[must_use]
	pub fn find_global(&self, pattern: Option<&Regex>) -> Vec<InstrumentRegistration> {
		let mut found = self.find_local(pattern);
		if let Some(parent) = &self.shared.parent {
			found.extend(parent.find_global(pattern));
		}
		found
	}

	/// Case-insensitive lookup across this registry and its ancestors,
	/// yielding only live mutable registrations (the only kind a source
	/// binding can attach to).
	#[must_use]
	pub fn get_mutable(&self, name: &str) -> Option<MutableInstrument> {
		let key = name.to_lowercase();
		let mut registry = Some(self);
		while let Some(current) = registry {
			let found = current
				.shared
				.instruments
				.read()
				.unwrap_or_else(PoisonError::into_inner)
				.get(&key)
				.cloned();
			if let Some(registration) = found {
				if matches!(registration.binding, Binding::Mutable(_))
					&& !registration.is_closed()
				{
					return Some(MutableInstrument::from_arc(&registration));
				}
			}
			registry = current.shared.parent.as_ref();
		}
		None
	}

	/// Listener over this registry and all registries chained below it.
	pub fn subscribe_global(&self, listener: Arc<dyn AvailabilityListener>) -> ListenerHandle {
		ListenerHandle {
			shared: Arc::downgrade(&self.shared),
			scope: ListenerScope::Global,
			id: self.shared.global_listeners.add(listener),
		}
	}

	/// Listener over this registry only.
	pub fn subscribe_local(&self, listener: Arc<dyn AvailabilityListener>) -> ListenerHandle {
		ListenerHandle {
			shared: Arc::downgrade(&self.shared),
			scope: ListenerScope::Local,
			id: self.shared.local_listeners.add(listener),
		}
	}

	/// One collection pass: invoke every callback of every local instrument
	/// against `recorder`. The external collector calls this on demand.
	pub fn collect(&self, recorder: &mut dyn GaugeRecorder) {
		let snapshot = self
			.shared
			.instruments
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.values()
			.cloned()
			.collect::<Vec<_>>();

		for registration in snapshot {
			registration.observe_into(recorder);
		}
	}

	/// Close every registration and refuse further ones.
	pub fn shutdown(&self) {
		self.shared.shut_down.store(true, Ordering::Release);
		for registration in self.find_local(None) {
			registration.close();
		}
	}

	fn load_persisted(&self) -> Result<(), RegistryError> {
		let Some(store) = &self.shared.store else {
			return Ok(());
		};

		for key in store.keys(INSTRUMENT_KEY_PREFIX)? {
			let Some(blob) = store.load(&key)? else {
				continue;
			};
			let definition: InstrumentDefinition = persist::from_blob(&blob)?;
			debug!(name = definition.name(), "restoring persisted instrument");
			match self.register_definition(definition) {
				Ok(_) => {}
				Err(RegistryError::DuplicateInstrument { name, .. }) => {
					warn!(name = %name, "persisted instrument already registered, skipping");
				}
				Err(e) => return Err(e),
			}
		}
		Ok(())
	}
}

impl RegistryShared {
	#[instrument(skip(self, binding), fields(instrument = definition.name()))]
	fn insert(
		self: &Arc<Self>,
		definition: InstrumentDefinition,
		binding: Binding,
	) -> Result<Arc<Registration>, RegistryError> {
		if self.shut_down.load(Ordering::Acquire) {
			return Err(RegistryError::ShutDown);
		}

		let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);

		let key = definition.lookup_name();
		if let Some(existing) = self
			.instruments
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&key)
		{
			return Err(RegistryError::DuplicateInstrument {
				name: definition.name().to_owned(),
				existing: existing.definition.clone(),
			});
		}

		// Persist before any listener learns about the instrument, so a
		// storage failure leaves no partial registration behind.
		if definition.persistent() {
			if let Some(store) = &self.store {
				store.save(
					&format!("{INSTRUMENT_KEY_PREFIX}{key}"),
					&persist::to_blob(&definition)?,
				)?;
			}
		}

		let registration = Arc::new(Registration {
			definition,
			registry: Arc::downgrade(self),
			binding,
			closed: AtomicBool::new(false),
		});
		let handle = InstrumentRegistration::from_arc(&registration);

		let mut panics = self.notify(|listener| listener.instrument_added(AvailabilityPhase::Pre, &handle));
		self.instruments
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(key, Arc::clone(&registration));
		panics.extend(
			self.notify(|listener| listener.instrument_added(AvailabilityPhase::Post, &handle)),
		);

		resume_first(panics);
		Ok(registration)
	}

	#[instrument(skip_all, fields(instrument = registration.definition.name()))]
	pub(crate) fn remove_registration(self: &Arc<Self>, registration: &Arc<Registration>) {
		let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);

		let key = registration.definition.lookup_name();
		{
			// Only remove the entry if it is still this registration; a
			// replacement under the same name must not be evicted.
			let instruments = self
				.instruments
				.read()
				.unwrap_or_else(PoisonError::into_inner);
			match instruments.get(&key) {
				Some(current) if Arc::ptr_eq(current, registration) => {}
				_ => return,
			}
		}

		let handle = InstrumentRegistration::from_arc(registration);

		let mut panics =
			self.notify(|listener| listener.instrument_removed(AvailabilityPhase::Pre, &handle));
		self.instruments
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&key);

		if registration.definition.persistent() {
			if let Some(store) = &self.store {
				if let Err(e) = store.remove(&format!("{INSTRUMENT_KEY_PREFIX}{key}")) {
					error!(?e, "failed to drop persisted instrument definition");
				}
			}
		}

		panics.extend(
			self.notify(|listener| listener.instrument_removed(AvailabilityPhase::Post, &handle)),
		);

		registration.drain_callbacks();

		resume_first(panics);
	}

	/// Run `f` against every interested listener: global listeners of this
	/// registry and every ancestor (root first), then local listeners.
	/// A panicking listener never prevents the others from running; panics
	/// are collected and the first one resumes after the mutation finished.
	fn notify(
		&self,
		f: impl Fn(&dyn AvailabilityListener),
	) -> Vec<Box<dyn Any + Send + 'static>> {
		let mut chain = Vec::new();
		let mut current = Some(self);
		while let Some(shared) = current {
			chain.push(shared.global_listeners.snapshot());
			current = shared.parent.as_ref().map(|p| p.shared.as_ref());
		}
		chain.reverse();
		chain.push(self.local_listeners.snapshot());

		let mut panics = Vec::new();
		for listener in chain.into_iter().flatten() {
			if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
				error!(
					message = panic_message(payload.as_ref()),
					"availability listener panicked"
				);
				panics.push(payload);
			}
		}
		panics
	}
}

fn resume_first(panics: Vec<Box<dyn Any + Send + 'static>>) {
	if let Some(first) = panics.into_iter().next() {
		std::panic::resume_unwind(first);
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
	payload
		.downcast_ref::<&str>()
		.copied()
		.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("<non-string panic payload>")
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::instrument::{GaugeValue, RecordedSample};

	fn registry() -> InstrumentRegistry {
		InstrumentRegistry::new(Arc::new(PipelineConfig::default()))
	}

	#[test]
	fn duplicate_names_are_rejected() {
		let registry = registry();

		registry
			.register_mutable(registry.gauge("game.test.counter"))
			.unwrap();

		let err = registry
			.register_mutable(registry.gauge("game.test.counter"))
			.unwrap_err();
		assert!(matches!(
			err,
			RegistryError::DuplicateInstrument { name, .. } if name == "game.test.counter"
		));

		assert_eq!(registry.find_local(None).len(), 1);
	}

	#[test]
	fn close_is_idempotent_and_fires_on_remove_once() {
		struct Counting(AtomicUsize);
		impl GaugeCallback for Counting {
			fn observe(&self, _: &InstrumentRegistration, _: &mut dyn GaugeRecorder) {}
			fn on_remove(&self, _: &InstrumentRegistration) {
				self.0.fetch_add(1, Ordering::SeqCst);
			}
		}

		let registry = registry();
		let instrument = registry
			.register_mutable(registry.gauge("game.test.counter"))
			.unwrap();

		let callback = Arc::new(Counting(AtomicUsize::new(0)));
		let handle = instrument.add_callback(callback.clone());
		assert!(handle.is_attached());

		instrument.registration().close();
		instrument.registration().close();

		assert!(!handle.is_attached());
		assert_eq!(callback.0.load(Ordering::SeqCst), 1);
		assert!(registry.find_local(None).is_empty());
	}

	#[test]
	fn pre_fires_before_mutation_and_post_after() {
		struct Watching {
			registry: InstrumentRegistry,
			seen: Mutex<Vec<(AvailabilityPhase, usize)>>,
		}
		impl AvailabilityListener for Watching {
			fn instrument_added(
				&self,
				phase: AvailabilityPhase,
				_: &InstrumentRegistration,
			) {
				let count = self.registry.find_local(None).len();
				self.seen
					.lock()
					.unwrap()
					.push((phase, count));
			}
			fn instrument_removed(
				&self,
				phase: AvailabilityPhase,
				_: &InstrumentRegistration,
			) {
				let count = self.registry.find_local(None).len();
				self.seen
					.lock()
					.unwrap()
					.push((phase, count));
			}
		}

		let registry = registry();
		let listener = Arc::new(Watching {
			registry: registry.clone(),
			seen: Mutex::new(Vec::new()),
		});
		let _handle = registry.subscribe_local(listener.clone());

		let instrument = registry
			.register_mutable(registry.gauge("game.test.counter"))
			.unwrap();
		instrument.registration().close();

		assert_eq!(
			*listener.seen.lock().unwrap(),
			vec![
				(AvailabilityPhase::Pre, 0),
				(AvailabilityPhase::Post, 1),
				(AvailabilityPhase::Pre, 1),
				(AvailabilityPhase::Post, 0),
			]
		);
	}

	#[test]
	fn panicking_listener_does_not_starve_siblings() {
		struct Panicking;
		impl AvailabilityListener for Panicking {
			fn instrument_added(&self, _: AvailabilityPhase, _: &InstrumentRegistration) {
				panic!("listener fault");
			}
			fn instrument_removed(&self, _: AvailabilityPhase, _: &InstrumentRegistration) {}
		}

		struct Counting(AtomicUsize);
		impl AvailabilityListener for Counting {
			fn instrument_added(&self, _: AvailabilityPhase, _: &InstrumentRegistration) {
				self.0.fetch_add(1, Ordering::SeqCst);
			}
			fn instrument_removed(&self, _: AvailabilityPhase, _: &InstrumentRegistration) {}
		}

		let registry = registry();
		let counting = Arc::new(Counting(AtomicUsize::new(0)));
		let _a = registry.subscribe_local(Arc::new(Panicking));
		let _b = registry.subscribe_local(counting.clone());

		let result = catch_unwind(AssertUnwindSafe(|| {
			registry.register_mutable(registry.gauge("game.test.counter"))
		}));

		// The panic resurfaces once, after every listener ran and the
		// registration committed.
		assert!(result.is_err());
		assert_eq!(counting.0.load(Ordering::SeqCst), 2);
		assert_eq!(registry.find_local(None).len(), 1);
	}

	#[test]
	fn find_global_walks_the_parent_chain() {
		let parent = registry();
		let child = parent.child();

		parent
			.register_mutable(parent.gauge("process.uptime"))
			.unwrap();
		child
			.register_mutable(child.gauge("game.test.counter"))
			.unwrap();

		assert_eq!(child.find_local(None).len(), 1);
		assert_eq!(child.find_global(None).len(), 2);
		assert_eq!(parent.find_global(None).len(), 1);

		let pattern = Regex::new("^game\\.").unwrap();
		assert_eq!(child.find_global(Some(&pattern)).len(), 1);
	}

	#[test]
	fn collect_reaches_immutable_and_mutable_callbacks() {
		let registry = registry();

		registry
			.register_immutable(
				registry.gauge("game.fixed"),
				|_: &InstrumentRegistration, recorder: &mut dyn GaugeRecorder| {
					recorder.record(GaugeValue::Long(7), &Default::default());
				},
			)
			.unwrap();

		let mutable = registry
			.register_mutable(registry.gauge("game.dynamic"))
			.unwrap();
		let _handle = mutable.add_callback(Arc::new(
			|_: &InstrumentRegistration, recorder: &mut dyn GaugeRecorder| {
				recorder.record(GaugeValue::Long(9), &Default::default());
			},
		));

		let mut samples = Vec::<RecordedSample>::new();
		registry.collect(&mut samples);

		let mut values = samples
			.iter()
			.map(|s| match s.value {
				GaugeValue::Long(v) => v,
				GaugeValue::Double(_) => unreachable!(),
			})
			.collect::<Vec<_>>();
		values.sort_unstable();
		assert_eq!(values, vec![7, 9]);
	}

	#[test]
	fn persistent_definitions_survive_reopen() {
		let store = Arc::new(crate::persist::MemoryStore::new());
		let config = Arc::new(PipelineConfig::default());

		{
			let registry = InstrumentRegistry::open(
				Arc::clone(&config),
				store.clone() as Arc<dyn PersistenceStore>,
			)
			.unwrap();
			registry
				.register_mutable(
					registry
						.gauge("game.energy.stored")
						.description("stored energy")
						.unit("J")
						.persistent(true),
				)
				.unwrap();
		}

		let reopened =
			InstrumentRegistry::open(config, store as Arc<dyn PersistenceStore>).unwrap();
		let found = reopened.find_local(None);
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].definition().name(), "game.energy.stored");
		assert!(found[0].definition().persistent());
		assert!(reopened.get_mutable("GAME.ENERGY.STORED").is_some());
	}
}
