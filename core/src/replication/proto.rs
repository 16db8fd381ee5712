//! Wire messages for registry replication.
//!
//! One header byte selects the message, followed by the payload. All
//! variable-length fields go through [`gw_wire_proto`] with the limits from
//! the pipeline config, enforced identically on encode and decode.

use std::collections::BTreeSet;

use gw_wire_proto::{decode, encode, FieldTooLong};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
	attribute::{AttributeKey, AttributeType},
	config::PipelineConfig,
	definition::{DefinitionError, InstrumentDefinition, InstrumentKind},
};

const FLAG_PERSISTENT: u8 = 1 << 0;
const FLAG_FLOATING: u8 = 1 << 1;

#[derive(Debug, Error)]
pub enum WireError {
	#[error("unknown replication message header {0:#04x}")]
	UnknownMessage(u8),
	#[error("unknown attribute type tag {0:#04x}")]
	UnknownAttributeType(u8),
	#[error(transparent)]
	Decode(#[from] decode::Error),
	#[error(transparent)]
	TooLong(#[from] FieldTooLong),
	/// The decoded definition is malformed (oversized field, bad name
	/// grammar, duplicate attribute). Rejected, never truncated.
	#[error(transparent)]
	Definition(#[from] DefinitionError),
	#[error("IoError({0})")]
	Io(#[from] std::io::Error),
}

/// Everything a client needs to rebuild its mirror from scratch.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
	pub reserved_names: BTreeSet<String>,
	pub instruments: Vec<InstrumentDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
	InstrumentAdded(InstrumentDefinition),
	InstrumentRemoved(InstrumentDefinition),
	ReservedNameAdded(String),
	ReservedNameRemoved(String),
	FullSyncRequest,
	FullSyncSnapshot(SyncSnapshot),
}

impl ReplicationMessage {
	fn header(&self) -> u8 {
		match self {
			Self::InstrumentAdded(_) => b'A',
			Self::InstrumentRemoved(_) => b'D',
			Self::ReservedNameAdded(_) => b'N',
			Self::ReservedNameRemoved(_) => b'F',
			Self::FullSyncRequest => b'Q',
			Self::FullSyncSnapshot(_) => b'S',
		}
	}

	pub fn to_bytes(&self, config: &PipelineConfig) -> Result<Vec<u8>, WireError> {
		let mut buf = vec![self.header()];

		match self {
			Self::InstrumentAdded(definition) | Self::InstrumentRemoved(definition) => {
				encode_definition(&mut buf, definition, config)?;
			}
			Self::ReservedNameAdded(name) | Self::ReservedNameRemoved(name) => {
				encode::string(&mut buf, name, config.max_name_len)?;
			}
			Self::FullSyncRequest => {}
			Self::FullSyncSnapshot(snapshot) => {
				encode_u16_count(&mut buf, snapshot.reserved_names.len())?;
				for name in &snapshot.reserved_names {
					encode::string(&mut buf, name, config.max_name_len)?;
				}
				encode_u16_count(&mut buf, snapshot.instruments.len())?;
				for definition in &snapshot.instruments {
					encode_definition(&mut buf, definition, config)?;
				}
			}
		}

		Ok(buf)
	}

	pub async fn from_stream(
		stream: &mut (impl AsyncRead + Unpin),
		config: &PipelineConfig,
	) -> Result<Self, WireError> {
		match stream.read_u8().await? {
			b'A' => Ok(Self::InstrumentAdded(
				decode_definition(stream, config).await?,
			)),
			b'D' => Ok(Self::InstrumentRemoved(
				decode_definition(stream, config).await?,
			)),
			b'N' => Ok(Self::ReservedNameAdded(
				decode::string(stream, config.max_name_len).await?,
			)),
			b'F' => Ok(Self::ReservedNameRemoved(
				decode::string(stream, config.max_name_len).await?,
			)),
			b'Q' => Ok(Self::FullSyncRequest),
			b'S' => {
				let reserved_count = stream.read_u16_le().await? as usize;
				let mut reserved_names = BTreeSet::new();
				for _ in 0..reserved_count {
					reserved_names.insert(decode::string(stream, config.max_name_len).await?);
				}

				let instrument_count = stream.read_u16_le().await? as usize;
				let mut instruments = Vec::with_capacity(instrument_count.min(1024));
				for _ in 0..instrument_count {
					instruments.push(decode_definition(stream, config).await?);
				}

				Ok(Self::FullSyncSnapshot(SyncSnapshot {
					reserved_names,
					instruments,
				}))
			}
			header => Err(WireError::UnknownMessage(header)),
		}
	}
}

fn encode_u16_count(buf: &mut Vec<u8>, len: usize) -> Result<(), FieldTooLong> {
	if len > u16::MAX as usize {
		return Err(FieldTooLong {
			len,
			max: u16::MAX as usize,
		});
	}
	buf.extend_from_slice(&(len as u16).to_le_bytes());
	Ok(())
}

fn encode_definition(
	buf: &mut Vec<u8>,
	definition: &InstrumentDefinition,
	config: &PipelineConfig,
) -> Result<(), WireError> {
	encode::string(buf, definition.name(), config.max_name_len)?;
	encode::string(buf, definition.description(), config.max_description_len)?;
	encode::string(buf, definition.unit(), config.max_unit_len)?;

	let mut flags = 0u8;
	if definition.persistent() {
		flags |= FLAG_PERSISTENT;
	}
	if definition.kind().is_floating() {
		flags |= FLAG_FLOATING;
	}
	buf.push(flags);

	encode::count(buf, definition.attributes().len())?;
	for key in definition.attributes() {
		encode::string(buf, key.name(), config.max_name_len)?;
		buf.push(key.ty().wire_tag());
	}

	Ok(())
}

async fn decode_definition(
	stream: &mut (impl AsyncRead + Unpin),
	config: &PipelineConfig,
) -> Result<InstrumentDefinition, WireError> {
	let name = decode::string(stream, config.max_name_len).await?;
	let description = decode::string(stream, config.max_description_len).await?;
	let unit = decode::string(stream, config.max_unit_len).await?;

	let flags = stream.read_u8().await?;
	let kind = if flags & FLAG_FLOATING != 0 {
		InstrumentKind::Double
	} else {
		InstrumentKind::Long
	};

	let attribute_count = decode::count(stream).await?;
	let mut attributes = Vec::with_capacity(attribute_count);
	for _ in 0..attribute_count {
		let attribute_name = decode::string(stream, config.max_name_len).await?;
		let tag = stream.read_u8().await?;
		let ty = AttributeType::from_wire_tag(tag).ok_or(WireError::UnknownAttributeType(tag))?;
		attributes.push(AttributeKey::new(attribute_name, ty));
	}

	// Re-validates grammar, limits and attribute uniqueness, so a malformed
	// buffer is rejected here rather than half-applied.
	Ok(InstrumentDefinition::new(
		name,
		description,
		unit,
		kind,
		flags & FLAG_PERSISTENT != 0,
		attributes,
		config,
	)?)
}
