//! Observation sources: pluggable producers of attributed measurements.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
	attribute::{AttributeKey, AttributeSet},
	instrument::GaugeValue,
	state::Diagnostic,
};

/// Stable identifier of an observation source within one container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for SourceId {
	fn from(id: &str) -> Self {
		Self::new(id)
	}
}

/// The source attributes the active mapping does not use. Sources consult
/// this to skip expensive attribute-specific work: an energy source can
/// report one rolled-up total instead of a per-fluid breakdown when the
/// "fluid" attribute is unused.
#[derive(Debug, Clone, Default)]
pub struct UnusedAttributes(HashSet<String>);

impl UnusedAttributes {
	pub(crate) fn from_names(names: impl IntoIterator<Item = String>) -> Self {
		Self(names.into_iter().collect())
	}

	#[must_use]
	pub fn is_unused(&self, name: &str) -> bool {
		self.0.contains(name)
	}

	pub fn iter(&self) -> impl Iterator<Item = &str> {
		self.0.iter().map(String::as_str)
	}
}

/// A failure raised while observing one source. Mapping diagnostics pass
/// through untouched; anything else is flattened into a message so one
/// faulty source never takes its siblings down with it.
#[derive(Debug, Error)]
pub enum ObserveError {
	#[error(transparent)]
	Mapping(#[from] Diagnostic),
	#[error("observation source failed: {0}")]
	Source(String),
}

impl ObserveError {
	pub fn source_failure(message: impl fmt::Display) -> Self {
		Self::Source(message.to_string())
	}
}

/// Receives a source's measurements, attributed with the source's own
/// attribute values. The container adapts this onto the bound instrument's
/// recorder, converting attributes along the way.
pub trait SourceRecorder {
	/// Record one measurement. Fails when a mapped attribute cannot be
	/// resolved; the source propagates the failure with `?` and the whole
	/// observation for this cycle is discarded.
	fn record(
		&mut self,
		value: GaugeValue,
		attributes: &AttributeSet,
	) -> Result<(), ObserveError>;
}

/// A stateless producer of measurements for some context type `C`.
///
/// Implementations come in three shapes: no declared attributes, a single
/// attribute, or several (parameterized sources additionally receive the
/// per-binding payload through `lookup`).
pub trait ObservationSource<C>: Send + Sync + 'static {
	fn id(&self) -> SourceId;

	/// The attributes this source can attach to its measurements.
	fn attributes(&self) -> Vec<AttributeKey>;

	/// Produce the current measurements for `context`.
	///
	/// `lookup` carries per-binding attribute values (a parameterized
	/// source's captured payload); values reported through `recorder` take
	/// precedence over it during resolution. `unused` names the declared
	/// attributes the active mapping ignores.
	fn observe(
		&self,
		context: &C,
		recorder: &mut dyn SourceRecorder,
		lookup: &AttributeSet,
		unused: &UnusedAttributes,
	) -> Result<(), ObserveError>;
}
