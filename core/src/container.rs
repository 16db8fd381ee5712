//! The per-context owner of observation source bindings.
//!
//! One container exists per context instance (one device, one machine). It
//! holds a [`SourceState`] per available source, routes dirty notifications,
//! and adapts source measurements onto the bound instruments' recorders.

use std::{
	collections::{BTreeMap, HashSet},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, PoisonError, RwLock, Weak,
	},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
	attribute::{AttributeKey, AttributeSet},
	instrument::{
		CallbackHandle, GaugeCallback, GaugeRecorder, GaugeValue, InstrumentRegistration,
	},
	mapping::AttributeMapping,
	persist::{self, PersistError, PersistenceStore},
	registry::InstrumentRegistry,
	source::{ObservationSource, ObserveError, SourceId, SourceRecorder},
	state::{Diagnostic, ErrorState, SourceConfiguration, SourceState},
};

const CONTAINER_KEY_PREFIX: &str = "containers/";

type DirtyHook = Arc<dyn Fn(&SourceId) + Send + Sync>;

struct ContainerInner<C> {
	context: C,
	context_id: Uuid,
	registry: InstrumentRegistry,
	states: BTreeMap<SourceId, Mutex<SourceState<C>>>,
	dirty_hooks: RwLock<Vec<DirtyHook>>,
	/// Source ids whose dirty handler is currently running. A dirty
	/// re-entry for one of these is dropped, not queued; the running pass
	/// reads the latest configuration anyway.
	in_flight: Mutex<HashSet<SourceId>>,
	set_up: AtomicBool,
}

/// Owns every (context, source) binding for one context instance.
pub struct SourceContainer<C: Send + Sync + 'static> {
	inner: Arc<ContainerInner<C>>,
}

impl<C: Send + Sync + 'static> Clone for SourceContainer<C> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

/// The observation callback a container attaches to a bound instrument.
struct ContainerCallback<C: Send + Sync + 'static> {
	container: Weak<ContainerInner<C>>,
	source_id: SourceId,
}

impl<C: Send + Sync + 'static> GaugeCallback for ContainerCallback<C> {
	fn observe(&self, _: &InstrumentRegistration, recorder: &mut dyn GaugeRecorder) {
		if let Some(inner) = self.container.upgrade() {
			SourceContainer { inner }.observe(recorder, Some(&self.source_id));
		}
	}

	fn on_remove(&self, instrument: &InstrumentRegistration) {
		let Some(inner) = self.container.upgrade() else {
			return;
		};
		let Some(state) = inner.states.get(&self.source_id) else {
			return;
		};

		let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
		// Only react when the vanishing instrument is the one we are bound
		// to; a stale on_remove from an already-replaced binding is noise.
		let still_bound = state
			.bound_instrument()
			.map_or(false, |bound| bound.registration().same_registration(instrument));
		if still_bound {
			state.clear_binding();
		}
	}
}

/// Buffers a source's measurements, resolving attributes through the
/// mapping. Nothing reaches the instrument recorder until the whole
/// observation succeeded, so a failing attribute never leaves a partial
/// record behind.
struct MappedRecorder<'a> {
	instrument_attributes: &'a [AttributeKey],
	mapping: &'a AttributeMapping,
	lookup: &'a AttributeSet,
	samples: Vec<(GaugeValue, AttributeSet)>,
}

impl SourceRecorder for MappedRecorder<'_> {
	fn record(
		&mut self,
		value: GaugeValue,
		attributes: &AttributeSet,
	) -> Result<(), ObserveError> {
		let resolved =
			self.mapping
				.resolve(self.instrument_attributes.iter(), attributes, self.lookup)?;
		self.samples.push((value, resolved));
		Ok(())
	}
}

/// Side effects collected while a state lock was held, applied afterwards.
#[derive(Default)]
struct Effects {
	released: Vec<CallbackHandle>,
	dirty: bool,
}

impl<C: Send + Sync + 'static> SourceContainer<C> {
	pub fn new(
		context: C,
		context_id: Uuid,
		registry: InstrumentRegistry,
		sources: impl IntoIterator<Item = Arc<dyn ObservationSource<C>>>,
	) -> Self {
		let states = sources
			.into_iter()
			.map(|source| (source.id(), Mutex::new(SourceState::new(source))))
			.collect();

		Self {
			inner: Arc::new(ContainerInner {
				context,
				context_id,
				registry,
				states,
				dirty_hooks: RwLock::default(),
				in_flight: Mutex::default(),
				set_up: AtomicBool::new(false),
			}),
		}
	}

	#[must_use]
	pub fn context(&self) -> &C {
		&self.inner.context
	}

	#[must_use]
	pub fn context_id(&self) -> Uuid {
		self.inner.context_id
	}

	pub fn source_ids(&self) -> impl Iterator<Item = &SourceId> {
		self.inner.states.keys()
	}

	/// Inspect one state under its lock.
	pub fn with_state<R>(
		&self,
		source: &SourceId,
		f: impl FnOnce(&SourceState<C>) -> R,
	) -> Option<R> {
		self.inner.states.get(source).map(|state| {
			let state = state.lock().unwrap_or_else(PoisonError::into_inner);
			f(&state)
		})
	}

	/// Activate the container: one synchronous dirty pass over every state,
	/// binding whatever is already configured. Idempotent.
	#[instrument(skip(self), fields(context_id = %self.inner.context_id))]
	pub fn setup(&self) {
		if self.inner.set_up.swap(true, Ordering::AcqRel) {
			return;
		}
		debug!("setting up observation container");
		for id in self.inner.states.keys() {
			self.notify_dirty(id);
		}
	}

	/// Subscribe to dirty notifications for every state in this container.
	pub fn subscribe_dirty(&self, hook: DirtyHook) {
		self.inner
			.dirty_hooks
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(hook);
	}

	/// Explicitly mark one binding dirty, re-running lookup and rebind.
	pub fn mark_dirty(&self, source: &SourceId) {
		if self.inner.states.contains_key(source) {
			self.notify_dirty(source);
		}
	}

	/// Replace one binding's configuration. No-op when handed the same
	/// `Arc` that is already installed.
	pub fn set_configuration(
		&self,
		source: &SourceId,
		configuration: Option<Arc<SourceConfiguration>>,
	) {
		let Some(state) = self.inner.states.get(source) else {
			warn!(%source, "set_configuration for unknown source");
			return;
		};

		let mut effects = Effects::default();
		{
			let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
			let (dirty, released) = state.set_configuration(configuration);
			effects.dirty = dirty;
			effects.released.extend(released);
		}
		self.finish(source, effects);
	}

	/// Close every binding. Idempotent; bound callbacks are detached and
	/// their `on_remove` hooks fire exactly once.
	pub fn close(&self) {
		let mut released = Vec::new();
		for state in self.inner.states.values() {
			let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
			released.extend(state.close());
		}
		for handle in released {
			handle.unregister();
		}
	}

	/// Observe one source (`Some`) or every observable source (`None`)
	/// into `recorder`.
	///
	/// A failing source records a diagnostic on its own state and never
	/// stops its siblings.
	pub fn observe(&self, recorder: &mut dyn GaugeRecorder, source: Option<&SourceId>) {
		let mut errored = Vec::new();

		match source {
			Some(id) => {
				if let Some(state) = self.inner.states.get(id) {
					if self.observe_state(id, state, recorder) {
						errored.push(id.clone());
					}
				}
			}
			None => {
				for (id, state) in &self.inner.states {
					if self.observe_state(id, state, recorder) {
						errored.push(id.clone());
					}
				}
			}
		}

		// Error-state changes notify subscribers; the rebind handler is not
		// involved, so a recorded failure stays visible until a dirty
		// trigger or a reconfiguration clears it.
		for id in errored {
			self.fire_hooks(&id);
		}
	}

	/// Returns whether the state's error state changed.
	fn observe_state(
		&self,
		id: &SourceId,
		state: &Mutex<SourceState<C>>,
		recorder: &mut dyn GaugeRecorder,
	) -> bool {
		let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
		if !state.should_be_observed() {
			return false;
		}
		let (Some(configuration), Some(instrument)) = (
			state.configuration().cloned(),
			state.bound_instrument().cloned(),
		) else {
			return false;
		};

		let definition = instrument.definition();
		let instrument_attributes = definition.attributes().cloned().collect::<Vec<_>>();

		if let Some(diagnostic) = configuration
			.mapping
			.validate_dynamic(instrument_attributes.iter())
			.or_else(|| configuration.mapping.validate_static())
		{
			debug!(source = %id, %diagnostic, "mapping validation failed");
			return state.record_error(diagnostic);
		}

		let source_attributes = state.source().attributes();
		let unused = configuration.mapping.unused_for(&source_attributes);

		let mut mapped = MappedRecorder {
			instrument_attributes: &instrument_attributes,
			mapping: &configuration.mapping,
			lookup: &configuration.payload,
			samples: Vec::new(),
		};

		match state.source().clone().observe(
			&self.inner.context,
			&mut mapped,
			&configuration.payload,
			&unused,
		) {
			Ok(()) => {
				for (value, attributes) in mapped.samples {
					recorder.record(value, &attributes);
				}
				false
			}
			Err(ObserveError::Mapping(diagnostic)) => {
				debug!(source = %id, %diagnostic, "observation skipped");
				state.record_error(diagnostic)
			}
			Err(ObserveError::Source(message)) => {
				warn!(source = %id, message = %message, "observation source failed");
				state.record_error(Diagnostic::SourceFailure { message })
			}
		}
	}

	fn notify_dirty(&self, id: &SourceId) {
		// Nothing binds before setup(); its initial pass picks up whatever
		// was configured or loaded in the meantime.
		if !self.inner.set_up.load(Ordering::Acquire) {
			return;
		}
		self.handle_dirty(id);
		self.fire_hooks(id);
	}

	fn fire_hooks(&self, id: &SourceId) {
		if !self.inner.set_up.load(Ordering::Acquire) {
			return;
		}
		let hooks = self
			.inner
			.dirty_hooks
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();
		for hook in hooks {
			hook(id);
		}
	}

	/// The container's own dirty handler: re-run the registry lookup and
	/// rebind. Re-entrant triggers for a state already being handled are
	/// ignored; concurrent triggers for different states proceed
	/// independently.
	fn handle_dirty(&self, id: &SourceId) {
		{
			let mut in_flight = self
				.inner
				.in_flight
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			if !in_flight.insert(id.clone()) {
				return;
			}
		}

		self.update_registration(id);

		self.inner
			.in_flight
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(id);
	}

	#[instrument(skip_all, fields(source = %id))]
	fn update_registration(&self, id: &SourceId) {
		let Some(state) = self.inner.states.get(id) else {
			return;
		};

		let mut effects = Effects::default();
		{
			let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
			if state.is_closed() {
				return;
			}

			match state.configuration().cloned() {
				None => {
					effects.released.extend(state.take_binding());
				}
				Some(configuration) => {
					let not_found = Diagnostic::InstrumentNotFound {
						name: configuration.instrument.clone(),
					};

					match self.inner.registry.get_mutable(&configuration.instrument) {
						None => {
							debug!(
								instrument = %configuration.instrument,
								"configured instrument not available"
							);
							effects.released.extend(state.take_binding());
							effects.dirty |= state.record_error(not_found);
						}
						Some(instrument) => {
							let already_bound = state.bound_instrument().map_or(false, |bound| {
								bound
									.registration()
									.same_registration(instrument.registration())
							});

							if !already_bound {
								let callback = Arc::new(ContainerCallback {
									container: Arc::downgrade(&self.inner),
									source_id: id.clone(),
								});
								let handle = instrument.add_callback(callback);
								effects.released.extend(state.bind(instrument, handle));
							}

							let cleared =
								state.error_state().clone().without_error(&not_found);
							effects.dirty |= state.set_error_state(cleared);
						}
					}
				}
			}
		}

		for handle in effects.released {
			handle.unregister();
		}
		if effects.dirty {
			self.fire_hooks(id);
		}
	}

	fn finish(&self, id: &SourceId, effects: Effects) {
		for handle in effects.released {
			handle.unregister();
		}
		if effects.dirty {
			self.notify_dirty(id);
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBinding {
	configuration: Option<SourceConfiguration>,
	error_state: ErrorState,
}

impl<C: Send + Sync + 'static> SourceContainer<C> {
	fn persist_key(&self) -> String {
		format!("{CONTAINER_KEY_PREFIX}{}", self.inner.context_id)
	}

	/// Persist every binding's configuration and error state under this
	/// container's context id.
	pub fn save(&self, store: &dyn PersistenceStore) -> Result<(), PersistError> {
		let mut bindings = BTreeMap::new();
		for (id, state) in &self.inner.states {
			let state = state.lock().unwrap_or_else(PoisonError::into_inner);
			bindings.insert(
				id.clone(),
				PersistedBinding {
					configuration: state.configuration().map(|c| (**c).clone()),
					error_state: state.error_state().clone(),
				},
			);
		}

		store.save(&self.persist_key(), &persist::to_blob(&bindings)?)
	}

	/// Restore bindings saved by [`SourceContainer::save`]. Meant to run
	/// before [`SourceContainer::setup`], whose initial dirty pass then
	/// performs the actual binding. Persisted sources that are no longer
	/// available are skipped.
	pub fn load(&self, store: &dyn PersistenceStore) -> Result<(), PersistError> {
		let Some(blob) = store.load(&self.persist_key())? else {
			return Ok(());
		};
		let bindings: BTreeMap<SourceId, PersistedBinding> = persist::from_blob(&blob)?;

		for (id, binding) in bindings {
			let Some(state) = self.inner.states.get(&id) else {
				warn!(source = %id, "persisted binding for unavailable source, skipping");
				continue;
			};

			let mut effects = Effects::default();
			{
				let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
				let (dirty, released) =
					state.set_configuration(binding.configuration.map(Arc::new));
				effects.dirty = dirty;
				effects.released.extend(released);
				effects.dirty |= state.set_error_state(binding.error_state);
			}
			self.finish(&id, effects);
		}

		Ok(())
	}

	/// Remove this container's persisted state.
	pub fn forget(&self, store: &dyn PersistenceStore) -> Result<(), PersistError> {
		store.remove(&self.persist_key())
	}
}
