//! Live instrument registrations and the callback machinery behind them.
//!
//! A registration is a definition plus a binding. Immutable registrations
//! wrap one fixed callback; mutable registrations carry any number of
//! independently attached callbacks, each removable through the handle
//! returned at attach time.

use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, PoisonError, Weak,
	},
};

use crate::{
	attribute::AttributeSet,
	definition::{InstrumentDefinition, InstrumentKind},
	registry::RegistryShared,
};

/// A single recorded measurement value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GaugeValue {
	Long(i64),
	Double(f64),
}

impl GaugeValue {
	#[must_use]
	pub fn kind(self) -> InstrumentKind {
		match self {
			Self::Long(_) => InstrumentKind::Long,
			Self::Double(_) => InstrumentKind::Double,
		}
	}
}

impl fmt::Display for GaugeValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Long(v) => write!(f, "{v}"),
			Self::Double(v) => write!(f, "{v}"),
		}
	}
}

/// Receives measurements during a collection pass. Implemented by the
/// external collector; [`Vec<RecordedSample>`] implements it for tests and
/// simple hosts.
pub trait GaugeRecorder {
	fn record(&mut self, value: GaugeValue, attributes: &AttributeSet);
}

/// One measurement as seen by a recorder.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSample {
	pub value: GaugeValue,
	pub attributes: AttributeSet,
}

impl GaugeRecorder for Vec<RecordedSample> {
	fn record(&mut self, value: GaugeValue, attributes: &AttributeSet) {
		self.push(RecordedSample {
			value,
			attributes: attributes.clone(),
		});
	}
}

/// An observer attached to an instrument registration.
pub trait GaugeCallback: Send + Sync + 'static {
	/// Produce the current measurement(s) for this instrument.
	fn observe(&self, instrument: &InstrumentRegistration, recorder: &mut dyn GaugeRecorder);

	/// Called exactly once when the callback is detached, either explicitly
	/// or because the registration closed.
	fn on_remove(&self, instrument: &InstrumentRegistration) {
		let _ = instrument;
	}
}

impl<F> GaugeCallback for F
where
	F: Fn(&InstrumentRegistration, &mut dyn GaugeRecorder) + Send + Sync + 'static,
{
	fn observe(&self, instrument: &InstrumentRegistration, recorder: &mut dyn GaugeRecorder) {
		self(instrument, recorder);
	}
}

pub(crate) enum Binding {
	Immutable(Arc<dyn GaugeCallback>),
	Mutable(Mutex<MutableBinding>),
}

#[derive(Default)]
pub(crate) struct MutableBinding {
	next_id: u64,
	callbacks: Vec<(u64, Arc<dyn GaugeCallback>)>,
}

/// A live entry in an [`InstrumentRegistry`](crate::registry::InstrumentRegistry).
pub struct Registration {
	pub(crate) definition: InstrumentDefinition,
	pub(crate) registry: Weak<RegistryShared>,
	pub(crate) binding: Binding,
	pub(crate) closed: AtomicBool,
}

impl fmt::Debug for Registration {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Registration")
			.field("name", &self.definition.name())
			.field("mutable", &matches!(self.binding, Binding::Mutable(_)))
			.field("closed", &self.closed.load(Ordering::Relaxed))
			.finish()
	}
}

impl Registration {
	pub(crate) fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Invoke every attached callback against `recorder`. Callbacks are
	/// snapshotted first so an observer attaching or detaching mid-pass
	/// never deadlocks against the binding lock.
	pub(crate) fn observe_into(self: &Arc<Self>, recorder: &mut dyn GaugeRecorder) {
		let handle = InstrumentRegistration::from_arc(self);
		match &self.binding {
			Binding::Immutable(callback) => callback.observe(&handle, recorder),
			Binding::Mutable(binding) => {
				let snapshot = binding
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.callbacks
					.iter()
					.map(|(_, callback)| Arc::clone(callback))
					.collect::<Vec<_>>();

				for callback in snapshot {
					callback.observe(&handle, recorder);
				}
			}
		}
	}

	/// Detach every callback, firing each `on_remove` exactly once. Used by
	/// close; safe to call repeatedly because the callback list drains.
	pub(crate) fn drain_callbacks(self: &Arc<Self>) {
		if let Binding::Mutable(binding) = &self.binding {
			let drained = std::mem::take(
				&mut binding
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.callbacks,
			);
			let handle = InstrumentRegistration::from_arc(self);
			for (_, callback) in drained {
				callback.on_remove(&handle);
			}
		}
	}
}

/// A shared handle to a live registration: definition access plus idempotent
/// close. Cheap to clone.
#[derive(Clone)]
pub struct InstrumentRegistration {
	inner: Arc<Registration>,
}

impl fmt::Debug for InstrumentRegistration {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.inner.fmt(f)
	}
}

impl InstrumentRegistration {
	pub(crate) fn from_arc(inner: &Arc<Registration>) -> Self {
		Self {
			inner: Arc::clone(inner),
		}
	}

	pub(crate) fn inner(&self) -> &Arc<Registration> {
		&self.inner
	}

	#[must_use]
	pub fn definition(&self) -> &InstrumentDefinition {
		&self.inner.definition
	}

	#[must_use]
	pub fn is_mutable(&self) -> bool {
		matches!(self.inner.binding, Binding::Mutable(_))
	}

	/// Whether two handles point at the same live registration.
	#[must_use]
	pub fn same_registration(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}

	/// Remove this registration from its registry. Idempotent; the second
	/// and later calls are no-ops.
	pub fn close(&self) {
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		if let Some(registry) = self.inner.registry.upgrade() {
			registry.remove_registration(&self.inner);
		} else {
			// Registry already gone; still honor the on_remove contract.
			self.inner.drain_callbacks();
		}
	}
}

/// A mutable registration: an [`InstrumentRegistration`] that also accepts
/// externally attached callbacks.
#[derive(Clone)]
pub struct MutableInstrument {
	handle: InstrumentRegistration,
}

impl fmt::Debug for MutableInstrument {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.handle.fmt(f)
	}
}

impl MutableInstrument {
	pub(crate) fn from_arc(inner: &Arc<Registration>) -> Self {
		Self {
			handle: InstrumentRegistration::from_arc(inner),
		}
	}

	#[must_use]
	pub fn registration(&self) -> &InstrumentRegistration {
		&self.handle
	}

	#[must_use]
	pub fn definition(&self) -> &InstrumentDefinition {
		self.handle.definition()
	}

	/// Attach an observer. Returns the handle that detaches it again; on a
	/// registration that already closed the callback is dropped untouched
	/// and the returned handle is inert.
	pub fn add_callback(&self, callback: Arc<dyn GaugeCallback>) -> CallbackHandle {
		let inner = self.handle.inner();
		let Binding::Mutable(binding) = &inner.binding else {
			unreachable!("MutableInstrument always wraps a mutable binding");
		};

		if inner.is_closed() {
			return CallbackHandle {
				registration: Weak::new(),
				id: 0,
			};
		}

		let mut binding = binding.lock().unwrap_or_else(PoisonError::into_inner);
		let id = binding.next_id;
		binding.next_id += 1;
		binding.callbacks.push((id, callback));

		CallbackHandle {
			registration: Arc::downgrade(inner),
			id,
		}
	}
}

/// Detaches one callback from a mutable registration. Consuming; dropping
/// the handle without calling [`CallbackHandle::unregister`] leaves the
/// callback attached for the registration's lifetime.
#[derive(Debug)]
pub struct CallbackHandle {
	registration: Weak<Registration>,
	id: u64,
}

impl CallbackHandle {
	/// Detach the callback and fire its `on_remove`. A handle whose
	/// registration already closed (which drained the callback and fired
	/// `on_remove` itself) does nothing.
	pub fn unregister(self) {
		let Some(inner) = self.registration.upgrade() else {
			return;
		};
		let Binding::Mutable(binding) = &inner.binding else {
			return;
		};

		let removed = {
			let mut binding = binding.lock().unwrap_or_else(PoisonError::into_inner);
			binding
				.callbacks
				.iter()
				.position(|(id, _)| *id == self.id)
				.map(|index| binding.callbacks.remove(index).1)
		};

		if let Some(callback) = removed {
			callback.on_remove(&InstrumentRegistration::from_arc(&inner));
		}
	}

	/// Whether this handle still points at an attached callback.
	#[must_use]
	pub fn is_attached(&self) -> bool {
		self.registration
			.upgrade()
			.is_some_and(|inner| match &inner.binding {
				Binding::Mutable(binding) => binding
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.callbacks
					.iter()
					.any(|(id, _)| *id == self.id),
				Binding::Immutable(_) => false,
			})
	}
}
