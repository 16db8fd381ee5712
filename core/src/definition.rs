//! Immutable instrument definitions and their validation rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{attribute::AttributeKey, config::PipelineConfig};

/// Hard cap on declared attributes; the wire format carries the count in a
/// single unsigned byte.
pub const MAX_ATTRIBUTES: usize = 255;

/// The value type a gauge records.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum InstrumentKind {
	Long,
	Double,
}

impl InstrumentKind {
	/// Whether this kind records floating point values. This is the
	/// "floating" flag carried on the wire.
	#[must_use]
	pub fn is_floating(self) -> bool {
		matches!(self, Self::Double)
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
	#[error("instrument name '{0}' is not a dotted lowercase identifier")]
	InvalidName(String),
	#[error("{field} of {len} bytes exceeds limit of {max}")]
	FieldTooLong {
		field: &'static str,
		len: usize,
		max: usize,
	},
	#[error("instrument '{name}' declares {count} attributes, limit is {MAX_ATTRIBUTES}")]
	TooManyAttributes { name: String, count: usize },
	#[error("duplicate attribute name '{0}'")]
	DuplicateAttribute(String),
}

/// An immutable description of a metric: name, description, unit, value kind,
/// persistence flag and declared attribute keys.
///
/// Validated at construction and again at wire decode; a definition value
/// that exists is a definition that passed both the identifier grammar and
/// the configured size limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDefinition {
	name: String,
	description: String,
	unit: String,
	kind: InstrumentKind,
	persistent: bool,
	attributes: BTreeMap<String, AttributeKey>,
}

impl InstrumentDefinition {
	pub fn new(
		name: impl Into<String>,
		description: impl Into<String>,
		unit: impl Into<String>,
		kind: InstrumentKind,
		persistent: bool,
		attributes: impl IntoIterator<Item = AttributeKey>,
		config: &PipelineConfig,
	) -> Result<Self, DefinitionError> {
		let name = name.into();
		let description = description.into();
		let unit = unit.into();

		if !is_valid_name(&name) {
			return Err(DefinitionError::InvalidName(name));
		}
		check_len("name", &name, config.max_name_len)?;
		check_len("description", &description, config.max_description_len)?;
		check_len("unit", &unit, config.max_unit_len)?;

		let mut map = BTreeMap::new();
		for key in attributes {
			check_len("attribute name", key.name(), config.max_name_len)?;
			if map.insert(key.name().to_owned(), key.clone()).is_some() {
				return Err(DefinitionError::DuplicateAttribute(key.name().to_owned()));
			}
		}
		if map.len() > MAX_ATTRIBUTES {
			return Err(DefinitionError::TooManyAttributes {
				name,
				count: map.len(),
			});
		}

		Ok(Self {
			name,
			description,
			unit,
			kind,
			persistent,
			attributes: map,
		})
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The case-folded name the registry and the client mirror key by.
	#[must_use]
	pub fn lookup_name(&self) -> String {
		self.name.to_lowercase()
	}

	#[must_use]
	pub fn description(&self) -> &str {
		&self.description
	}

	#[must_use]
	pub fn unit(&self) -> &str {
		&self.unit
	}

	#[must_use]
	pub fn kind(&self) -> InstrumentKind {
		self.kind
	}

	#[must_use]
	pub fn persistent(&self) -> bool {
		self.persistent
	}

	#[must_use]
	pub fn attribute(&self, name: &str) -> Option<&AttributeKey> {
		self.attributes.get(name)
	}

	pub fn attributes(&self) -> impl ExactSizeIterator<Item = &AttributeKey> {
		self.attributes.values()
	}
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), DefinitionError> {
	if value.len() > max {
		return Err(DefinitionError::FieldTooLong {
			field,
			len: value.len(),
			max,
		});
	}
	Ok(())
}

/// Dotted lowercase segments: `game.energy.stored`. Each segment starts with
/// a letter and continues with letters, digits or underscores.
fn is_valid_name(name: &str) -> bool {
	!name.is_empty()
		&& name.split('.').all(|segment| {
			let mut chars = segment.chars();
			chars
				.next()
				.is_some_and(|c| c.is_ascii_lowercase())
				&& chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
		})
}
