//! Object formats.
//!
//! A format is an opaque token for one concrete byte layout of an
//! object type. The engine never inspects payload bytes itself; it
//! drives them exclusively through the operations below. Formats are
//! registered once in a [`FormatRegistry`] and shared as trait objects.

mod capabilities;
mod converter;

pub use capabilities::Capabilities;
pub use converter::{ConvertFn, Converter, ConverterPath};

use crate::error::{SyncError, SyncResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Result of comparing two payloads of the same format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpResult {
	/// Different objects
	Mismatch,
	/// Same object, different content
	Similar,
	/// Same object, same content
	Same,
}

/// Outcome of duplicating a record under a fresh uid
#[derive(Debug, Clone)]
pub struct Duplicated {
	pub uid: String,
	pub bytes: Vec<u8>,
	/// True when the duplicate differs from the stored record and must
	/// be written back to the originating peer.
	pub dirty: bool,
}

/// One concrete byte layout of an object type.
///
/// Only `name`, `objtype` and `compare` are mandatory; everything else
/// has a pass-through or unsupported default, mirroring how optional
/// these operations are for real formats.
pub trait ObjectFormat: Send + Sync {
	fn name(&self) -> &str;

	fn objtype(&self) -> &str;

	fn compare(&self, left: &[u8], right: &[u8]) -> SyncResult<CmpResult>;

	fn copy(&self, data: &[u8]) -> SyncResult<Vec<u8>> {
		Ok(data.to_vec())
	}

	fn duplicate(&self, _uid: &str, _data: &[u8]) -> SyncResult<Duplicated> {
		Err(SyncError::not_supported(format!(
			"format {} has no duplicate operation",
			self.name()
		)))
	}

	fn print(&self, data: &[u8]) -> String {
		String::from_utf8_lossy(data).into_owned()
	}

	/// Monotonic revision of a payload, for use-latest resolution.
	fn revision(&self, _data: &[u8]) -> SyncResult<i64> {
		Err(SyncError::not_supported(format!(
			"format {} has no revision operation",
			self.name()
		)))
	}

	fn marshal(&self, data: &[u8]) -> SyncResult<Vec<u8>> {
		Ok(data.to_vec())
	}

	fn demarshal(&self, data: &[u8]) -> SyncResult<Vec<u8>> {
		Ok(data.to_vec())
	}

	fn validate(&self, _data: &[u8]) -> SyncResult<()> {
		Ok(())
	}

	fn has_merger(&self) -> bool {
		false
	}

	/// Restore fields missing from `input` out of the archived `entire`
	/// snapshot, honoring the peer's capabilities.
	fn merge(&self, _input: &[u8], _entire: &[u8], _caps: &Capabilities) -> SyncResult<Vec<u8>> {
		Err(SyncError::not_supported(format!(
			"format {} has no merger",
			self.name()
		)))
	}

	/// Strip fields the peer cannot store.
	fn demerge(&self, _input: &[u8], _caps: &Capabilities) -> SyncResult<Vec<u8>> {
		Err(SyncError::not_supported(format!(
			"format {} has no merger",
			self.name()
		)))
	}
}

impl fmt::Debug for dyn ObjectFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ObjectFormat({}/{})", self.objtype(), self.name())
	}
}

/// Byte-identity format, available for every object type.
///
/// Used for injected changelog entries and as the simplest real format
/// in tests: payloads compare byte for byte.
pub struct PlainFormat {
	objtype: String,
}

impl PlainFormat {
	pub fn for_objtype(objtype: impl Into<String>) -> Arc<dyn ObjectFormat> {
		Arc::new(Self {
			objtype: objtype.into(),
		})
	}
}

impl ObjectFormat for PlainFormat {
	fn name(&self) -> &str {
		"plain"
	}

	fn objtype(&self) -> &str {
		&self.objtype
	}

	fn compare(&self, left: &[u8], right: &[u8]) -> SyncResult<CmpResult> {
		Ok(if left == right {
			CmpResult::Same
		} else {
			CmpResult::Mismatch
		})
	}

	fn duplicate(&self, uid: &str, data: &[u8]) -> SyncResult<Duplicated> {
		Ok(Duplicated {
			uid: format!("{uid}-dupe"),
			bytes: data.to_vec(),
			dirty: true,
		})
	}
}

/// All formats and converters known to one engine instance.
///
/// Built by the embedder before the engine starts and shared immutably
/// afterwards.
#[derive(Default)]
pub struct FormatRegistry {
	formats: HashMap<String, Arc<dyn ObjectFormat>>,
	converters: Vec<Converter>,
}

impl FormatRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_format(&mut self, format: Arc<dyn ObjectFormat>) {
		self.formats.insert(format.name().to_owned(), format);
	}

	pub fn register_converter(&mut self, converter: Converter) {
		self.converters.push(converter);
	}

	pub fn format(&self, name: &str) -> Option<&Arc<dyn ObjectFormat>> {
		self.formats.get(name)
	}

	pub fn num_formats(&self) -> usize {
		self.formats.len()
	}

	pub(crate) fn converters(&self) -> &[Converter] {
		&self.converters
	}

	/// Shortest converter chain from `source` to any of `targets`.
	///
	/// `preferred` wins on equal length. Returns an empty path when the
	/// source already is an accepted target.
	pub fn find_path(
		&self,
		source: &str,
		targets: &[String],
		preferred: Option<&str>,
	) -> SyncResult<ConverterPath> {
		converter::find_path(self, source, targets, preferred)
	}

	/// Apply a converter path to payload bytes.
	pub fn convert_along(
		&self,
		path: &ConverterPath,
		bytes: Vec<u8>,
	) -> SyncResult<(Vec<u8>, Arc<dyn ObjectFormat>)> {
		converter::convert_along(self, path, bytes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plain_format_compares_bytes() {
		let plain = PlainFormat::for_objtype("contact");
		assert_eq!(
			plain.compare(b"Alice", b"Alice").unwrap(),
			CmpResult::Same
		);
		assert_eq!(
			plain.compare(b"Alice", b"Bob").unwrap(),
			CmpResult::Mismatch
		);
	}

	#[test]
	fn registry_finds_registered_formats() {
		let mut registry = FormatRegistry::new();
		registry.register_format(PlainFormat::for_objtype("contact"));

		assert!(registry.format("plain").is_some());
		assert!(registry.format("vcard30").is_none());
	}
}
