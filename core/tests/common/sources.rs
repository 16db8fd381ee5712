//! Observation sources over a fake device, one per source shape.

use std::sync::{
	atomic::{AtomicI64, Ordering},
	Mutex,
};

use gw_core::{
	AttributeKey, AttributeSet, AttributeType, AttributeValue, GaugeValue, ObservationSource,
	ObserveError, SourceId, SourceRecorder, UnusedAttributes,
};

/// The context a container is bound to in these tests.
#[derive(Debug, Default)]
pub struct TestDevice {
	pub counter: AtomicI64,
	pub tanks: Mutex<Vec<(String, i64)>>,
}

impl TestDevice {
	pub fn set_counter(&self, value: i64) {
		self.counter.store(value, Ordering::SeqCst);
	}

	pub fn set_tanks(&self, tanks: Vec<(String, i64)>) {
		*self.tanks.lock().unwrap() = tanks;
	}
}

/// Zero-attribute source: reports the device counter.
pub struct CounterSource;

impl ObservationSource<TestDevice> for CounterSource {
	fn id(&self) -> SourceId {
		SourceId::new("counter")
	}

	fn attributes(&self) -> Vec<AttributeKey> {
		Vec::new()
	}

	fn observe(
		&self,
		context: &TestDevice,
		recorder: &mut dyn SourceRecorder,
		_lookup: &AttributeSet,
		_unused: &UnusedAttributes,
	) -> Result<(), ObserveError> {
		recorder.record(
			GaugeValue::Long(context.counter.load(Ordering::SeqCst)),
			&AttributeSet::new(),
		)
	}
}

/// Single-attribute source: per-fluid tank levels, rolled up into one total
/// when the "fluid" attribute is unused.
pub struct TankSource;

impl ObservationSource<TestDevice> for TankSource {
	fn id(&self) -> SourceId {
		SourceId::new("tank_levels")
	}

	fn attributes(&self) -> Vec<AttributeKey> {
		vec![AttributeKey::new("fluid", AttributeType::Str)]
	}

	fn observe(
		&self,
		context: &TestDevice,
		recorder: &mut dyn SourceRecorder,
		_lookup: &AttributeSet,
		unused: &UnusedAttributes,
	) -> Result<(), ObserveError> {
		let tanks = context.tanks.lock().unwrap();

		if unused.is_unused("fluid") {
			let total = tanks.iter().map(|(_, amount)| amount).sum();
			recorder.record(GaugeValue::Long(total), &AttributeSet::new())
		} else {
			for (fluid, amount) in tanks.iter() {
				recorder.record(
					GaugeValue::Long(*amount),
					&AttributeSet::new().with("fluid", AttributeValue::Str(fluid.clone())),
				)?;
			}
			Ok(())
		}
	}
}

/// Parameterized source: the "side" attribute comes from the per-binding
/// payload, not from the measurement itself.
pub struct SidedCounterSource;

impl ObservationSource<TestDevice> for SidedCounterSource {
	fn id(&self) -> SourceId {
		SourceId::new("sided_counter")
	}

	fn attributes(&self) -> Vec<AttributeKey> {
		vec![AttributeKey::new("side", AttributeType::Long)]
	}

	fn observe(
		&self,
		context: &TestDevice,
		recorder: &mut dyn SourceRecorder,
		_lookup: &AttributeSet,
		_unused: &UnusedAttributes,
	) -> Result<(), ObserveError> {
		recorder.record(
			GaugeValue::Long(context.counter.load(Ordering::SeqCst)),
			&AttributeSet::new(),
		)
	}
}

/// A source that always fails, for sibling-isolation tests.
pub struct BrokenSource;

impl ObservationSource<TestDevice> for BrokenSource {
	fn id(&self) -> SourceId {
		SourceId::new("broken")
	}

	fn attributes(&self) -> Vec<AttributeKey> {
		Vec::new()
	}

	fn observe(
		&self,
		_context: &TestDevice,
		_recorder: &mut dyn SourceRecorder,
		_lookup: &AttributeSet,
		_unused: &UnusedAttributes,
	) -> Result<(), ObserveError> {
		Err(ObserveError::source_failure("device exploded"))
	}
}
