//! Typed attribute keys and the conversion algebra between them.
//!
//! Instruments declare the attributes they record under; observation sources
//! declare the attributes they natively produce. The two sets rarely match
//! exactly, so mapping validation relies on a small, asymmetric compatibility
//! relation between attribute types rather than plain equality.

use std::{
	collections::BTreeMap,
	fmt,
	hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

/// The value type an attribute can carry.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum AttributeType {
	Long,
	Double,
	Bool,
	Str,
}

/// Which conversion applies between a source type and a target type.
///
/// Exactly one path is chosen, in this priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionPath {
	/// Types are equal; the value passes through untouched.
	Identity,
	/// The source type is losslessly representable in the target type.
	Narrow,
	/// The target type declares itself constructible from the source type.
	Widen,
}

impl AttributeType {
	/// Asymmetric "narrow" compatibility: a value of `self` can be converted
	/// into `target` without loss. Identity is deliberately not part of this
	/// relation; it is its own conversion path.
	#[must_use]
	pub fn can_convert_to(self, target: Self) -> bool {
		matches!(
			(self, target),
			(Self::Long, Self::Double) | (Self::Bool, Self::Long) | (Self::Bool, Self::Double)
		)
	}

	/// "Widen" compatibility: `self` can be constructed from any `source`
	/// value. Only strings widen, and only from scalars.
	#[must_use]
	pub fn can_widen_from(self, source: Self) -> bool {
		self == Self::Str && source != Self::Str
	}

	/// Resolve the single conversion path from `self` to `target`, if any.
	#[must_use]
	pub fn conversion_to(self, target: Self) -> Option<ConversionPath> {
		if self == target {
			Some(ConversionPath::Identity)
		} else if self.can_convert_to(target) {
			Some(ConversionPath::Narrow)
		} else if target.can_widen_from(self) {
			Some(ConversionPath::Widen)
		} else {
			None
		}
	}

	pub(crate) fn wire_tag(self) -> u8 {
		match self {
			Self::Long => 0,
			Self::Double => 1,
			Self::Bool => 2,
			Self::Str => 3,
		}
	}

	pub(crate) fn from_wire_tag(tag: u8) -> Option<Self> {
		match tag {
			0 => Some(Self::Long),
			1 => Some(Self::Double),
			2 => Some(Self::Bool),
			3 => Some(Self::Str),
			_ => None,
		}
	}
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
	Long(i64),
	Double(f64),
	Bool(bool),
	Str(String),
}

impl AttributeValue {
	#[must_use]
	pub fn ty(&self) -> AttributeType {
		match self {
			Self::Long(_) => AttributeType::Long,
			Self::Double(_) => AttributeType::Double,
			Self::Bool(_) => AttributeType::Bool,
			Self::Str(_) => AttributeType::Str,
		}
	}

	/// Convert this value into `target`, following the conversion algebra.
	/// Returns `None` when no path applies.
	#[must_use]
	pub fn convert_to(&self, target: AttributeType) -> Option<Self> {
		match self.ty().conversion_to(target)? {
			ConversionPath::Identity => Some(self.clone()),
			ConversionPath::Narrow => self.narrow_to(target),
			ConversionPath::Widen => Some(Self::Str(self.render())),
		}
	}

	fn narrow_to(&self, target: AttributeType) -> Option<Self> {
		match (self, target) {
			(Self::Long(v), AttributeType::Double) => Some(Self::Double(*v as f64)),
			(Self::Bool(b), AttributeType::Long) => Some(Self::Long(i64::from(*b))),
			(Self::Bool(b), AttributeType::Double) => {
				Some(Self::Double(if *b { 1.0 } else { 0.0 }))
			}
			_ => None,
		}
	}

	fn render(&self) -> String {
		match self {
			Self::Long(v) => v.to_string(),
			Self::Double(v) => v.to_string(),
			Self::Bool(v) => v.to_string(),
			Self::Str(v) => v.clone(),
		}
	}
}

impl fmt::Display for AttributeValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.render())
	}
}

/// A named, typed attribute descriptor.
///
/// Equality covers name and type; hashing covers the name only, so two keys
/// that disagree on type still land in the same bucket and the disagreement
/// surfaces as a validation diagnostic instead of a silent duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeKey {
	name: String,
	ty: AttributeType,
}

impl AttributeKey {
	pub fn new(name: impl Into<String>, ty: AttributeType) -> Self {
		Self {
			name: name.into(),
			ty,
		}
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn ty(&self) -> AttributeType {
		self.ty
	}
}

impl PartialEq for AttributeKey {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name && self.ty == other.ty
	}
}

impl Eq for AttributeKey {}

impl Hash for AttributeKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.name.hash(state);
	}
}

impl fmt::Display for AttributeKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.name, self.ty)
	}
}

/// A set of attribute values keyed by attribute name.
///
/// Used both for the values a source reports alongside a measurement and for
/// the resolved values handed to an instrument. Name-keyed, so iteration
/// order is stable regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet(BTreeMap<String, AttributeValue>);

impl AttributeSet {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
		self.insert(name, value);
		self
	}

	pub fn insert(&mut self, name: impl Into<String>, value: AttributeValue) {
		self.0.insert(name.into(), value);
	}

	#[must_use]
	pub fn get(&self, name: &str) -> Option<&AttributeValue> {
		self.0.get(name)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v))
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
	fn from_iter<I: IntoIterator<Item = (String, AttributeValue)>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}
