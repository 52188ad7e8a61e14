//! Record headers and payloads.
//!
//! A [`Change`] is what peers report and receive: a peer-local uid, an
//! optional change-detection hash, a change type and an optional owned
//! payload. The payload lives in a separate [`Data`] value so format
//! converters can transform bytes without touching change metadata.

use crate::error::{SyncError, SyncResult};
use crate::format::{CmpResult, ObjectFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How a record changed since the last synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
	Unknown,
	Added,
	Modified,
	Deleted,
	Unmodified,
}

impl ChangeType {
	/// Stable integer representation used in the archive changelog.
	pub fn as_db(self) -> i64 {
		match self {
			Self::Unknown => 0,
			Self::Added => 1,
			Self::Modified => 2,
			Self::Deleted => 3,
			Self::Unmodified => 4,
		}
	}

	pub fn from_db(value: i64) -> Self {
		match value {
			1 => Self::Added,
			2 => Self::Modified,
			3 => Self::Deleted,
			4 => Self::Unmodified,
			_ => Self::Unknown,
		}
	}
}

impl fmt::Display for ChangeType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Unknown => "unknown",
			Self::Added => "added",
			Self::Modified => "modified",
			Self::Deleted => "deleted",
			Self::Unmodified => "unmodified",
		};
		write!(f, "{name}")
	}
}

/// An owned payload tagged with its format
#[derive(Clone)]
pub struct Data {
	bytes: Vec<u8>,
	format: Arc<dyn ObjectFormat>,
	/// Overrides the format's object type for encapsulating formats
	/// that can carry foreign records.
	objtype: Option<String>,
}

impl Data {
	pub fn new(bytes: Vec<u8>, format: Arc<dyn ObjectFormat>) -> Self {
		Self {
			bytes,
			format,
			objtype: None,
		}
	}

	pub fn with_objtype(mut self, objtype: impl Into<String>) -> Self {
		self.objtype = Some(objtype.into());
		self
	}

	pub fn bytes(&self) -> &[u8] {
		&self.bytes
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.bytes
	}

	pub fn set_bytes(&mut self, bytes: Vec<u8>) {
		self.bytes = bytes;
	}

	pub fn format(&self) -> &Arc<dyn ObjectFormat> {
		&self.format
	}

	pub fn set_format(&mut self, format: Arc<dyn ObjectFormat>) {
		self.format = format;
	}

	pub fn objtype(&self) -> &str {
		self.objtype.as_deref().unwrap_or_else(|| self.format.objtype())
	}

	pub fn set_objtype(&mut self, objtype: Option<String>) {
		self.objtype = objtype;
	}
}

impl fmt::Debug for Data {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Data")
			.field("len", &self.bytes.len())
			.field("format", &self.format.name())
			.field("objtype", &self.objtype())
			.finish()
	}
}

/// One reported record change
#[derive(Debug, Clone)]
pub struct Change {
	uid: String,
	hash: Option<String>,
	change_type: ChangeType,
	data: Option<Data>,
	/// Routing objtype for changes without a payload (deletions)
	objtype: Option<String>,
}

impl Change {
	/// Build a change, enforcing the payload invariant: deletions (and
	/// not-yet-classified changes) may omit the payload, everything
	/// else must carry one.
	pub fn new(
		uid: impl Into<String>,
		change_type: ChangeType,
		data: Option<Data>,
	) -> SyncResult<Self> {
		let uid = uid.into();
		if uid.is_empty() {
			return Err(SyncError::generic("change without a uid"));
		}
		if data.is_none() && !matches!(change_type, ChangeType::Deleted | ChangeType::Unknown) {
			return Err(SyncError::generic(format!(
				"{change_type} change {uid} carries no payload"
			)));
		}
		Ok(Self {
			uid,
			hash: None,
			change_type,
			data,
			objtype: None,
		})
	}

	pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
		self.hash = Some(hash.into());
		self
	}

	pub fn with_objtype(mut self, objtype: impl Into<String>) -> Self {
		self.objtype = Some(objtype.into());
		self
	}

	pub fn uid(&self) -> &str {
		&self.uid
	}

	pub fn set_uid(&mut self, uid: impl Into<String>) {
		self.uid = uid.into();
	}

	pub fn hash(&self) -> Option<&str> {
		self.hash.as_deref()
	}

	pub fn set_hash(&mut self, hash: impl Into<String>) {
		self.hash = Some(hash.into());
	}

	pub fn change_type(&self) -> ChangeType {
		self.change_type
	}

	pub fn set_change_type(&mut self, change_type: ChangeType) {
		self.change_type = change_type;
	}

	pub fn data(&self) -> Option<&Data> {
		self.data.as_ref()
	}

	pub fn data_mut(&mut self) -> Option<&mut Data> {
		self.data.as_mut()
	}

	pub fn set_data(&mut self, data: Option<Data>) {
		self.data = data;
	}

	pub fn format(&self) -> Option<&Arc<dyn ObjectFormat>> {
		self.data.as_ref().map(Data::format)
	}

	/// The effective object type: an explicit tag wins, else the
	/// payload's.
	pub fn objtype(&self) -> Option<&str> {
		self.objtype
			.as_deref()
			.or_else(|| self.data.as_ref().map(Data::objtype))
	}

	pub fn set_objtype(&mut self, objtype: impl Into<String>) {
		self.objtype = Some(objtype.into());
	}

	/// Compare two changes through their payload format.
	///
	/// Two deletions are the same object; a deletion never matches a
	/// payload-carrying change.
	pub fn compare(&self, other: &Change) -> SyncResult<CmpResult> {
		match (&self.data, &other.data) {
			(None, None) => Ok(CmpResult::Same),
			(Some(_), None) | (None, Some(_)) => Ok(CmpResult::Mismatch),
			(Some(left), Some(right)) => left.format().compare(left.bytes(), right.bytes()),
		}
	}
}
