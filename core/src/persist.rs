//! Persistence provider: an opaque key/value blob store.
//!
//! The pipeline persists two things through this interface: definitions of
//! persistent instruments (reloaded before a registry opens for new
//! registrations) and per-container observation configuration. Blobs are
//! MessagePack, but nothing here cares; stores move bytes.

use std::{
	collections::BTreeMap,
	fs, io,
	path::{Path, PathBuf},
	sync::Mutex,
};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
	#[error("file I/O error: {source}; path: '{path}'")]
	Io {
		path: Box<Path>,
		#[source]
		source: io::Error,
	},
	#[error("invalid persistence key '{0}'")]
	InvalidKey(String),
	#[error("error encoding persisted state")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("error decoding persisted state")]
	Decode(#[from] rmp_serde::decode::Error),
}

/// A reliable blob store. Keys are `/`-separated paths of lowercase
/// identifier segments.
pub trait PersistenceStore: Send + Sync {
	fn save(&self, key: &str, blob: &[u8]) -> Result<(), PersistError>;
	fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistError>;
	fn remove(&self, key: &str) -> Result<(), PersistError>;
	/// All stored keys starting with `prefix`.
	fn keys(&self, prefix: &str) -> Result<Vec<String>, PersistError>;
}

pub fn to_blob<T: Serialize>(value: &T) -> Result<Vec<u8>, PersistError> {
	Ok(rmp_serde::to_vec_named(value)?)
}

pub fn from_blob<T: DeserializeOwned>(blob: &[u8]) -> Result<T, PersistError> {
	Ok(rmp_serde::from_slice(blob)?)
}

/// In-memory store, for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryStore(Mutex<BTreeMap<String, Vec<u8>>>);

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
		self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}

impl PersistenceStore for MemoryStore {
	fn save(&self, key: &str, blob: &[u8]) -> Result<(), PersistError> {
		self.entries().insert(key.to_owned(), blob.to_vec());
		Ok(())
	}

	fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistError> {
		Ok(self.entries().get(key).cloned())
	}

	fn remove(&self, key: &str) -> Result<(), PersistError> {
		self.entries().remove(key);
		Ok(())
	}

	fn keys(&self, prefix: &str) -> Result<Vec<String>, PersistError> {
		Ok(self
			.entries()
			.keys()
			.filter(|k| k.starts_with(prefix))
			.cloned()
			.collect())
	}
}

/// Filesystem-backed store: each key becomes a file under the root
/// directory, key segments becoming path segments.
#[derive(Debug)]
pub struct FileStore {
	root: PathBuf,
}

impl FileStore {
	pub fn new(root: impl Into<PathBuf>) -> Result<Self, PersistError> {
		let root = root.into();
		fs::create_dir_all(&root).map_err(|source| PersistError::Io {
			path: root.clone().into_boxed_path(),
			source,
		})?;
		Ok(Self { root })
	}

	fn path_for(&self, key: &str) -> Result<PathBuf, PersistError> {
		if key.is_empty()
			|| !key.split('/').all(|segment| {
				!segment.is_empty()
					&& segment
						.chars()
						.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
					&& segment != "." && segment != ".."
			}) {
			return Err(PersistError::InvalidKey(key.to_owned()));
		}

		let mut path = self.root.clone();
		path.extend(key.split('/'));
		Ok(path)
	}

	fn io_err(path: &Path, source: io::Error) -> PersistError {
		PersistError::Io {
			path: path.into(),
			source,
		}
	}
}

impl PersistenceStore for FileStore {
	fn save(&self, key: &str, blob: &[u8]) -> Result<(), PersistError> {
		let path = self.path_for(key)?;
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
		}
		fs::write(&path, blob).map_err(|e| Self::io_err(&path, e))
	}

	fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistError> {
		let path = self.path_for(key)?;
		match fs::read(&path) {
			Ok(blob) => Ok(Some(blob)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(Self::io_err(&path, e)),
		}
	}

	fn remove(&self, key: &str) -> Result<(), PersistError> {
		let path = self.path_for(key)?;
		match fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(Self::io_err(&path, e)),
		}
	}

	fn keys(&self, prefix: &str) -> Result<Vec<String>, PersistError> {
		fn walk(
			root: &Path,
			dir: &Path,
			out: &mut Vec<String>,
		) -> Result<(), PersistError> {
			let entries = match fs::read_dir(dir) {
				Ok(entries) => entries,
				Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
				Err(e) => return Err(FileStore::io_err(dir, e)),
			};
			for entry in entries {
				let entry = entry.map_err(|e| FileStore::io_err(dir, e))?;
				let path = entry.path();
				if path.is_dir() {
					walk(root, &path, out)?;
				} else if let Ok(rel) = path.strip_prefix(root) {
					let key = rel
						.components()
						.map(|c| c.as_os_str().to_string_lossy())
						.collect::<Vec<_>>()
						.join("/");
					out.push(key);
				}
			}
			Ok(())
		}

		let mut keys = Vec::new();
		walk(&self.root, &self.root, &mut keys)?;
		keys.retain(|k| k.starts_with(prefix));
		keys.sort();
		Ok(keys)
	}
}
