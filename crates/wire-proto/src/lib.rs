//! Length-prefixed binary encoding/decoding primitives for the replication
//! wire protocol.
//!
//! Every variable-length field carries an explicit limit, enforced on both the
//! encode and decode side. An oversized field is an error, never a silent
//! truncation, so both peers agree on what can possibly be on the wire.

use thiserror::Error;

pub mod decode {
	use tokio::io::{AsyncRead, AsyncReadExt};

	use super::FieldTooLong;

	#[derive(Debug, thiserror::Error)]
	pub enum Error {
		#[error("IoError({0})")]
		IoError(#[from] std::io::Error),
		#[error("Utf8Error({0})")]
		Utf8Error(#[from] std::string::FromUtf8Error),
		#[error(transparent)]
		TooLong(#[from] FieldTooLong),
	}

	/// Deserialize a string as its u16 length and UTF-8 data, rejecting
	/// lengths above `max`.
	pub async fn string(
		stream: &mut (impl AsyncRead + Unpin),
		max: usize,
	) -> Result<String, Error> {
		let len = stream.read_u16_le().await? as usize;
		if len > max {
			return Err(FieldTooLong { len, max }.into());
		}

		let mut buf = vec![0u8; len];
		stream.read_exact(&mut buf).await?;

		String::from_utf8(buf).map_err(Into::into)
	}

	/// Deserialize a collection count as a single u8.
	pub async fn count(stream: &mut (impl AsyncRead + Unpin)) -> Result<usize, Error> {
		Ok(stream.read_u8().await? as usize)
	}
}

pub mod encode {
	use super::FieldTooLong;

	/// Serialize a string as its u16 length and UTF-8 data, rejecting
	/// lengths above `max`.
	pub fn string(buf: &mut Vec<u8>, s: &str, max: usize) -> Result<(), FieldTooLong> {
		if s.len() > max || s.len() > u16::MAX as usize {
			return Err(FieldTooLong {
				len: s.len(),
				max: max.min(u16::MAX as usize),
			});
		}

		buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
		buf.extend(s.as_bytes());

		Ok(())
	}

	/// Serialize a collection count as a single u8. Counts above 255 don't
	/// fit the wire format.
	pub fn count(buf: &mut Vec<u8>, len: usize) -> Result<(), FieldTooLong> {
		if len > u8::MAX as usize {
			return Err(FieldTooLong {
				len,
				max: u8::MAX as usize,
			});
		}

		buf.push(len as u8);

		Ok(())
	}
}

/// A variable-length field exceeded the limit agreed for it on the wire.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("field of {len} bytes exceeds wire limit of {max}")]
pub struct FieldTooLong {
	pub len: usize,
	pub max: usize,
}
