//! Group configuration.
//!
//! A group names the peers that synchronize together, the object types
//! they exchange and the engine switches that apply to all of them. The
//! configuration lives as `group.toml` in the group's config directory,
//! next to the archive and the lock file.

use crate::error::{SyncError, SyncResult};
use crate::format::Capabilities;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

const GROUP_FILE: &str = "group.toml";

/// Stable identifier of a peer within its group.
///
/// Assigned once in the group file; keys archive rows and the engine's
/// phase bitmask positions.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MemberId(pub u32);

impl fmt::Display for MemberId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// One object type a peer can handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
	pub objtype: String,
	#[serde(default = "default_true")]
	pub read: bool,
	#[serde(default = "default_true")]
	pub write: bool,
	/// Formats the peer accepts for this object type, most specific
	/// first.
	#[serde(default)]
	pub formats: Vec<String>,
	#[serde(default)]
	pub preferred_format: Option<String>,
}

impl SinkConfig {
	pub fn new(objtype: impl Into<String>) -> Self {
		Self {
			objtype: objtype.into(),
			read: true,
			write: true,
			formats: Vec::new(),
			preferred_format: None,
		}
	}

	pub fn with_formats<I, S>(mut self, formats: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.formats = formats.into_iter().map(Into::into).collect();
		self
	}

	pub fn read_only(mut self) -> Self {
		self.write = false;
		self
	}
}

/// One peer of the group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
	pub id: MemberId,
	pub name: String,
	#[serde(default)]
	pub sinks: Vec<SinkConfig>,
	#[serde(default)]
	pub capabilities: Option<Capabilities>,
}

impl MemberConfig {
	pub fn new(id: MemberId, name: impl Into<String>) -> Self {
		Self {
			id,
			name: name.into(),
			sinks: Vec::new(),
			capabilities: None,
		}
	}

	pub fn with_sink(mut self, sink: SinkConfig) -> Self {
		self.sinks.push(sink);
		self
	}

	pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
		self.capabilities = Some(capabilities);
		self
	}

	pub fn sink(&self, objtype: &str) -> Option<&SinkConfig> {
		self.sinks.iter().find(|s| s.objtype == objtype)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjTypeConfig {
	pub name: String,
	#[serde(default = "default_true")]
	pub enabled: bool,
}

fn default_true() -> bool {
	true
}

/// A synchronization group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
	/// Stable identity of the group, minted when the group is created
	#[serde(default = "Uuid::new_v4")]
	pub id: Uuid,
	pub name: String,
	#[serde(skip)]
	config_dir: PathBuf,
	#[serde(default)]
	pub members: Vec<MemberConfig>,
	#[serde(default)]
	pub objtypes: Vec<ObjTypeConfig>,
	/// Reconstruct lossy payloads through member capabilities
	#[serde(default = "default_true")]
	pub merger_enabled: bool,
	/// Convert payloads between formats on read and write
	#[serde(default = "default_true")]
	pub converter_enabled: bool,
	#[serde(default)]
	pub last_sync: Option<DateTime<Utc>>,
}

impl Group {
	pub fn new(name: impl Into<String>, config_dir: impl Into<PathBuf>) -> Self {
		Self {
			id: Uuid::new_v4(),
			name: name.into(),
			config_dir: config_dir.into(),
			members: Vec::new(),
			objtypes: Vec::new(),
			merger_enabled: true,
			converter_enabled: true,
			last_sync: None,
		}
	}

	/// Read `group.toml` from `config_dir`, or create a fresh group of
	/// that name when none exists yet.
	pub fn load_or_create(name: impl Into<String>, config_dir: &Path) -> SyncResult<Self> {
		let path = config_dir.join(GROUP_FILE);
		if path.exists() {
			let raw = fs::read_to_string(&path)?;
			let mut group: Group = toml::from_str(&raw)
				.map_err(|e| SyncError::misconfiguration(format!("unreadable group file: {e}")))?;
			group.config_dir = config_dir.to_path_buf();
			Ok(group)
		} else {
			info!("no group file at {}, creating one", path.display());
			let group = Self::new(name, config_dir);
			group.save()?;
			Ok(group)
		}
	}

	pub fn save(&self) -> SyncResult<()> {
		fs::create_dir_all(&self.config_dir)?;
		let raw = toml::to_string_pretty(self)
			.map_err(|e| SyncError::generic(format!("unserializable group: {e}")))?;
		fs::write(self.config_dir.join(GROUP_FILE), raw)?;
		Ok(())
	}

	pub fn config_dir(&self) -> &Path {
		&self.config_dir
	}

	pub fn archive_path(&self) -> PathBuf {
		self.config_dir.join("archive.db")
	}

	pub fn lock_path(&self) -> PathBuf {
		self.config_dir.join("lock")
	}

	pub fn add_member(&mut self, member: MemberConfig) {
		self.members.push(member);
	}

	pub fn add_objtype(&mut self, name: impl Into<String>) {
		self.objtypes.push(ObjTypeConfig {
			name: name.into(),
			enabled: true,
		});
	}

	pub fn member(&self, id: MemberId) -> Option<&MemberConfig> {
		self.members.iter().find(|m| m.id == id)
	}

	pub fn member_mut(&mut self, id: MemberId) -> Option<&mut MemberConfig> {
		self.members.iter_mut().find(|m| m.id == id)
	}

	pub fn enabled_objtypes(&self) -> impl Iterator<Item = &str> {
		self.objtypes
			.iter()
			.filter(|o| o.enabled)
			.map(|o| o.name.as_str())
	}

	pub fn objtype_enabled(&self, name: &str) -> bool {
		self.objtypes.iter().any(|o| o.enabled && o.name == name)
	}
}
