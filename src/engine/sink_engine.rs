//! One peer's participation in one object type.
//!
//! A sink engine is addressed by its stable position (the peer ordinal
//! inside the owning object engine's bitmasks). Peers without a sink
//! for the object type still get a slot: a "dummy" sink that never
//! sees proxy calls but can hold entries for cross-type bookkeeping.

use super::mapping_engine::MappingEngine;
use crate::archive::Archive;
use crate::config::{MemberId, SinkConfig};
use crate::data::{Change, ChangeType};
use crate::error::SyncResult;
use crate::format::{Capabilities, ConverterPath, FormatRegistry};
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug)]
pub(crate) struct SinkEngine {
	position: usize,
	member: MemberId,
	/// False for dummy sinks: the peer has no sink for this objtype
	active: bool,
	writable: bool,
	/// Changes reported by the peer but not yet matched to a mapping
	unmapped: VecDeque<Change>,
	/// Converter path reused for every entry written to this peer
	cached_path: Option<ConverterPath>,
}

impl SinkEngine {
	pub fn new(position: usize, member: MemberId, active: bool, writable: bool) -> Self {
		Self {
			position,
			member,
			active,
			writable,
			unmapped: VecDeque::new(),
			cached_path: None,
		}
	}

	pub fn position(&self) -> usize {
		self.position
	}

	pub fn member(&self) -> MemberId {
		self.member
	}

	pub fn is_active(&self) -> bool {
		self.active
	}

	pub fn is_writable(&self) -> bool {
		self.active && self.writable
	}

	pub fn push_unmapped(&mut self, change: Change) {
		self.unmapped.push_back(change);
	}

	pub fn pop_unmapped(&mut self) -> Option<Change> {
		self.unmapped.pop_front()
	}

	pub fn reset(&mut self) {
		self.unmapped.clear();
		self.cached_path = None;
	}

	/// Stash every full payload to the archive and strip the fields
	/// this peer cannot hold, so its next report can be merged back.
	pub async fn demerge(
		&self,
		mappings: &mut [MappingEngine],
		archive: &Archive,
		caps: &Capabilities,
	) -> SyncResult<()> {
		for mapping in mappings.iter_mut() {
			let id = mapping.id();
			let entry = mapping.entry_mut(self.position);
			let Some(change) = entry.change_mut() else {
				continue;
			};
			if change.change_type() == ChangeType::Deleted {
				continue;
			}
			let Some(data) = change.data_mut() else {
				continue;
			};
			if !data.format().has_merger() {
				continue;
			}

			let objtype = data.objtype().to_owned();
			let entire = data.format().marshal(data.bytes())?;
			archive.save_data(id, &objtype, &entire).await?;

			let stripped = data.format().demerge(data.bytes(), caps)?;
			trace!(
				"demerged mapping {id} for member {}: {} -> {} bytes",
				self.member,
				entire.len(),
				stripped.len()
			);
			data.set_bytes(stripped);
		}
		Ok(())
	}

	/// Convert every pending payload into a format this peer accepts.
	pub fn convert_to_dest(
		&mut self,
		mappings: &mut [MappingEngine],
		registry: &FormatRegistry,
		sink: &SinkConfig,
	) -> SyncResult<()> {
		if sink.formats.is_empty() {
			return Ok(());
		}

		for mapping in mappings.iter_mut() {
			let entry = mapping.entry_mut(self.position);
			let Some(change) = entry.change_mut() else {
				continue;
			};
			if change.change_type() == ChangeType::Deleted {
				continue;
			}
			let Some(data) = change.data_mut() else {
				continue;
			};

			// The conversion may switch to a format of another objtype
			// family; the change keeps reporting its own.
			let objtype = data.objtype().to_owned();

			let path = match self.cached_path.clone() {
				Some(path) => path,
				None => {
					let path = registry.find_path(
						data.format().name(),
						&sink.formats,
						sink.preferred_format.as_deref(),
					)?;
					self.cached_path = Some(path.clone());
					path
				}
			};

			if path.is_identity() {
				continue;
			}

			let (converted, format) = registry.convert_along(&path, data.bytes().to_vec())?;
			let keeps_objtype = format.objtype() == objtype;
			data.set_bytes(converted);
			data.set_format(format);
			data.set_objtype(if keeps_objtype { None } else { Some(objtype) });
		}
		Ok(())
	}
}
