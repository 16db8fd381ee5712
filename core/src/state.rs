//! Per-binding state: configuration, error accumulation and the bound
//! instrument.
//!
//! A [`SourceState`] never outlives its container, which owns the locking
//! around it; everything here takes `&mut self` and leaves dirty-notification
//! fan-out to the caller.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
	attribute::{AttributeKey, AttributeSet},
	instrument::{CallbackHandle, MutableInstrument},
	mapping::AttributeMapping,
	source::{ObservationSource, SourceId},
};

/// A single validation or binding problem, attached to the binding it
/// concerns. Diagnostics are compared structurally so repeated occurrences
/// deduplicate.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Diagnostic {
	#[error("instrument '{name}' was not found in the registry")]
	InstrumentNotFound { name: String },
	#[error("instrument attribute '{attribute}' has no mapped source attribute")]
	MappingMissing { attribute: String },
	#[error("source attribute '{from}' cannot be converted to instrument attribute '{to}'")]
	TypeIncompatible { from: AttributeKey, to: AttributeKey },
	#[error("observation source failed: {message}")]
	SourceFailure { message: String },
}

/// Accumulated health of one binding.
///
/// `Warnings` always carries at least one warning and `Errors` at least one
/// error; the transition helpers below keep the variant consistent with the
/// lists, so matching on the variant is enough to know the severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorState {
	#[default]
	Ok,
	Warnings(Vec<Diagnostic>),
	Errors {
		errors: Vec<Diagnostic>,
		warnings: Vec<Diagnostic>,
	},
}

impl ErrorState {
	fn normalize(errors: Vec<Diagnostic>, warnings: Vec<Diagnostic>) -> Self {
		match (errors.is_empty(), warnings.is_empty()) {
			(true, true) => Self::Ok,
			(true, false) => Self::Warnings(warnings),
			(false, _) => Self::Errors { errors, warnings },
		}
	}

	fn into_parts(self) -> (Vec<Diagnostic>, Vec<Diagnostic>) {
		match self {
			Self::Ok => (Vec::new(), Vec::new()),
			Self::Warnings(warnings) => (Vec::new(), warnings),
			Self::Errors { errors, warnings } => (errors, warnings),
		}
	}

	#[must_use]
	pub fn is_ok(&self) -> bool {
		matches!(self, Self::Ok)
	}

	#[must_use]
	pub fn has_errors(&self) -> bool {
		matches!(self, Self::Errors { .. })
	}

	#[must_use]
	pub fn errors(&self) -> &[Diagnostic] {
		match self {
			Self::Errors { errors, .. } => errors,
			_ => &[],
		}
	}

	#[must_use]
	pub fn warnings(&self) -> &[Diagnostic] {
		match self {
			Self::Warnings(warnings) | Self::Errors { warnings, .. } => warnings,
			Self::Ok => &[],
		}
	}

	/// Add an error; a no-op when the same diagnostic is already present.
	#[must_use]
	pub fn with_error(self, diagnostic: Diagnostic) -> Self {
		let (mut errors, warnings) = self.into_parts();
		if !errors.contains(&diagnostic) {
			errors.push(diagnostic);
		}
		Self::normalize(errors, warnings)
	}

	/// Add a warning; a no-op when the same diagnostic is already present.
	#[must_use]
	pub fn with_warning(self, diagnostic: Diagnostic) -> Self {
		let (errors, mut warnings) = self.into_parts();
		if !warnings.contains(&diagnostic) {
			warnings.push(diagnostic);
		}
		Self::normalize(errors, warnings)
	}

	/// Remove an error; a no-op when absent.
	#[must_use]
	pub fn without_error(self, diagnostic: &Diagnostic) -> Self {
		let (mut errors, warnings) = self.into_parts();
		errors.retain(|d| d != diagnostic);
		Self::normalize(errors, warnings)
	}

	/// Remove a warning; a no-op when absent.
	#[must_use]
	pub fn without_warning(self, diagnostic: &Diagnostic) -> Self {
		let (errors, mut warnings) = self.into_parts();
		warnings.retain(|d| d != diagnostic);
		Self::normalize(errors, warnings)
	}
}

impl fmt::Display for ErrorState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ok => f.write_str("ok"),
			Self::Warnings(warnings) => write!(f, "{} warning(s)", warnings.len()),
			Self::Errors { errors, warnings } => {
				write!(f, "{} error(s), {} warning(s)", errors.len(), warnings.len())
			}
		}
	}
}

/// What one binding observes: an instrument (by name), how the source's
/// attributes feed it, and the per-binding payload of a parameterized
/// source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfiguration {
	pub instrument: String,
	pub mapping: AttributeMapping,
	#[serde(default)]
	pub payload: AttributeSet,
}

impl SourceConfiguration {
	pub fn new(instrument: impl Into<String>, mapping: AttributeMapping) -> Self {
		Self {
			instrument: instrument.into(),
			mapping,
			payload: AttributeSet::new(),
		}
	}

	#[must_use]
	pub fn with_payload(mut self, payload: AttributeSet) -> Self {
		self.payload = payload;
		self
	}
}

pub(crate) struct BoundInstrument {
	pub instrument: MutableInstrument,
	pub callback: Option<CallbackHandle>,
}

/// The mutable record behind one (context, source) binding.
pub struct SourceState<C> {
	source: Arc<dyn ObservationSource<C>>,
	configuration: Option<Arc<SourceConfiguration>>,
	error_state: ErrorState,
	bound: Option<BoundInstrument>,
	closed: bool,
}

impl<C: 'static> fmt::Debug for SourceState<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SourceState")
			.field("source", &self.source.id())
			.field("configured", &self.configuration.is_some())
			.field("bound", &self.bound.is_some())
			.field("error_state", &self.error_state)
			.field("closed", &self.closed)
			.finish()
	}
}

impl<C: 'static> SourceState<C> {
	pub(crate) fn new(source: Arc<dyn ObservationSource<C>>) -> Self {
		Self {
			source,
			configuration: None,
			error_state: ErrorState::Ok,
			bound: None,
			closed: false,
		}
	}

	#[must_use]
	pub fn source_id(&self) -> SourceId {
		self.source.id()
	}

	pub(crate) fn source(&self) -> &Arc<dyn ObservationSource<C>> {
		&self.source
	}

	#[must_use]
	pub fn configuration(&self) -> Option<&Arc<SourceConfiguration>> {
		self.configuration.as_ref()
	}

	#[must_use]
	pub fn error_state(&self) -> &ErrorState {
		&self.error_state
	}

	#[must_use]
	pub fn bound_instrument(&self) -> Option<&MutableInstrument> {
		self.bound.as_ref().map(|bound| &bound.instrument)
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.closed
	}

	/// Whether this binding takes part in observation right now.
	#[must_use]
	pub fn should_be_observed(&self) -> bool {
		!self.closed
			&& self.configuration.is_some()
			&& self.bound.is_some()
			&& !self.error_state.has_errors()
	}

	/// Replace the configuration. Returns whether the state became dirty,
	/// plus a callback handle the caller must release outside the state
	/// lock (releasing in place would re-enter this state through the
	/// callback's `on_remove`). Writing the same `Arc` back, or `None` over
	/// `None`, is a detected no-op.
	pub(crate) fn set_configuration(
		&mut self,
		configuration: Option<Arc<SourceConfiguration>>,
	) -> (bool, Option<CallbackHandle>) {
		if self.closed {
			return (false, None);
		}

		let unchanged = match (&self.configuration, &configuration) {
			(None, None) => true,
			(Some(old), Some(new)) => Arc::ptr_eq(old, new),
			_ => false,
		};
		if unchanged {
			return (false, None);
		}

		let keeps_instrument = match (&self.configuration, &configuration) {
			(Some(old), Some(new)) => {
				old.instrument.eq_ignore_ascii_case(&new.instrument)
			}
			_ => false,
		};
		let released = if keeps_instrument {
			None
		} else {
			self.take_binding()
		};

		self.configuration = configuration;
		self.error_state = ErrorState::Ok;
		(true, released)
	}

	pub(crate) fn set_error_state(&mut self, error_state: ErrorState) -> bool {
		if self.error_state == error_state {
			return false;
		}
		self.error_state = error_state;
		true
	}

	pub(crate) fn record_error(&mut self, diagnostic: Diagnostic) -> bool {
		let updated = self.error_state.clone().with_error(diagnostic);
		self.set_error_state(updated)
	}

	/// Install a new binding, returning the previous binding's callback
	/// handle for the caller to release.
	pub(crate) fn bind(
		&mut self,
		instrument: MutableInstrument,
		callback: CallbackHandle,
	) -> Option<CallbackHandle> {
		let released = self.take_binding();
		self.bound = Some(BoundInstrument {
			instrument,
			callback: Some(callback),
		});
		released
	}

	/// Drop the current binding, returning the callback handle for the
	/// caller to release. Safe when nothing is bound.
	pub(crate) fn take_binding(&mut self) -> Option<CallbackHandle> {
		self.bound.take().and_then(|mut bound| bound.callback.take())
	}

	/// Drop the binding without detaching; used when the instrument itself
	/// is going away and has already drained its callbacks.
	pub(crate) fn clear_binding(&mut self) {
		self.bound = None;
	}

	/// Idempotent terminal transition. Returns the callback handle to
	/// release, if any.
	pub(crate) fn close(&mut self) -> Option<CallbackHandle> {
		if self.closed {
			return None;
		}
		self.closed = true;
		self.take_binding()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn diag(name: &str) -> Diagnostic {
		Diagnostic::InstrumentNotFound { name: name.into() }
	}

	#[test]
	fn error_state_variant_tracks_contents() {
		let state = ErrorState::Ok;
		assert!(state.is_ok());

		let state = state.with_warning(diag("a"));
		assert!(matches!(state, ErrorState::Warnings(_)));

		let state = state.with_error(diag("b"));
		assert!(state.has_errors());
		assert_eq!(state.warnings().len(), 1);

		let state = state.without_error(&diag("b"));
		assert!(matches!(state, ErrorState::Warnings(_)));

		let state = state.without_warning(&diag("a"));
		assert!(state.is_ok());
	}

	#[test]
	fn adding_a_present_diagnostic_is_a_no_op() {
		let state = ErrorState::Ok.with_error(diag("a")).with_error(diag("a"));
		assert_eq!(state.errors().len(), 1);

		// removing something absent is equally inert
		let state = state.without_error(&diag("zzz"));
		assert_eq!(state.errors().len(), 1);
	}

	#[test]
	fn accumulation_preserves_insertion_order() {
		let state = ErrorState::Ok
			.with_error(diag("first"))
			.with_error(diag("second"))
			.with_error(diag("first"));
		assert_eq!(
			state.errors(),
			&[diag("first"), diag("second")]
		);
	}
}
