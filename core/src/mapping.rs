//! The attribute mapping between an instrument's declared attributes and a
//! source's native ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
	attribute::{AttributeKey, AttributeSet},
	source::UnusedAttributes,
	state::Diagnostic,
};

/// One instrument attribute fed from one source attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingPair {
	pub instrument: AttributeKey,
	pub source: AttributeKey,
}

/// Maps instrument attribute names to the source attributes that feed them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeMapping {
	entries: BTreeMap<String, MappingPair>,
}

impl AttributeMapping {
	#[must_use]
	pub fn empty() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with(mut self, instrument: AttributeKey, source: AttributeKey) -> Self {
		self.insert(instrument, source);
		self
	}

	pub fn insert(&mut self, instrument: AttributeKey, source: AttributeKey) {
		self.entries.insert(
			instrument.name().to_owned(),
			MappingPair { instrument, source },
		);
	}

	#[must_use]
	pub fn source_for(&self, instrument_attribute: &str) -> Option<&AttributeKey> {
		self.entries.get(instrument_attribute).map(|pair| &pair.source)
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Every mapped pair must be convertible. Pure; returns the first
	/// offending pair as a diagnostic.
	#[must_use]
	pub fn validate_static(&self) -> Option<Diagnostic> {
		self.entries.values().find_map(|pair| {
			pair.source
				.ty()
				.conversion_to(pair.instrument.ty())
				.is_none()
				.then(|| Diagnostic::TypeIncompatible {
					from: pair.source.clone(),
					to: pair.instrument.clone(),
				})
		})
	}

	/// Every attribute the instrument declares must appear as a mapping
	/// target. Pure; returns the first missing attribute as a diagnostic.
	#[must_use]
	pub fn validate_dynamic<'a>(
		&self,
		instrument_attributes: impl IntoIterator<Item = &'a AttributeKey>,
	) -> Option<Diagnostic> {
		instrument_attributes.into_iter().find_map(|key| {
			(!self.entries.contains_key(key.name())).then(|| Diagnostic::MappingMissing {
				attribute: key.name().to_owned(),
			})
		})
	}

	/// The declared source attributes no mapping entry reads.
	#[must_use]
	pub fn unused_for(&self, source_attributes: &[AttributeKey]) -> UnusedAttributes {
		UnusedAttributes::from_names(
			source_attributes
				.iter()
				.filter(|key| {
					!self
						.entries
						.values()
						.any(|pair| pair.source.name() == key.name())
				})
				.map(|key| key.name().to_owned()),
		)
	}

	/// Resolve the full instrument attribute set for one measurement.
	///
	/// `reported` is what the source attached to the measurement; `lookup`
	/// carries the per-binding payload values. Reported values win. Any
	/// instrument attribute without a resolvable, convertible value fails
	/// the whole resolution.
	pub fn resolve<'a>(
		&self,
		instrument_attributes: impl IntoIterator<Item = &'a AttributeKey>,
		reported: &AttributeSet,
		lookup: &AttributeSet,
	) -> Result<AttributeSet, Diagnostic> {
		let mut resolved = AttributeSet::new();

		for key in instrument_attributes {
			let source = self
				.source_for(key.name())
				.ok_or_else(|| Diagnostic::MappingMissing {
					attribute: key.name().to_owned(),
				})?;

			let value = reported
				.get(source.name())
				.or_else(|| lookup.get(source.name()))
				.ok_or_else(|| Diagnostic::MappingMissing {
					attribute: key.name().to_owned(),
				})?;

			let converted =
				value
					.convert_to(key.ty())
					.ok_or_else(|| Diagnostic::TypeIncompatible {
						from: source.clone(),
						to: key.clone(),
					})?;

			resolved.insert(key.name(), converted);
		}

		Ok(resolved)
	}
}
