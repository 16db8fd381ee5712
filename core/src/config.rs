//! Pipeline configuration.

use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Field limits and storage settings for one pipeline instance.
///
/// The wire codec enforces the same limits on encode and decode, so every
/// peer of a replication channel must agree on the configuration in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PipelineConfig {
	/// Maximum instrument or attribute name length, in bytes.
	pub max_name_len: usize,
	/// Maximum instrument description length, in bytes.
	pub max_description_len: usize,
	/// Maximum instrument unit length, in bytes.
	pub max_unit_len: usize,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			max_name_len: 255,
			max_description_len: 1024,
			max_unit_len: 63,
		}
	}
}

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("error saving or loading the config from the filesystem")]
	IO(#[from] io::Error),
	#[error("error serializing or deserializing the JSON in the config file")]
	Json(#[from] serde_json::Error),
}

impl PipelineConfig {
	/// Read a config file, falling back to defaults when the file does not
	/// exist yet.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		if !path.exists() {
			debug!("no pipeline config at {}, using defaults", path.display());
			return Ok(Self::default());
		}

		let file = fs::File::open(path)?;
		Ok(serde_json::from_reader(file)?)
	}

	pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
		let file = fs::File::create(path.as_ref())?;
		serde_json::to_writer_pretty(file, self)?;
		Ok(())
	}
}
