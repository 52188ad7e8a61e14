//! Per-entry runtime state.
//!
//! An entry engine pairs one durable [`MappingEntry`] with the change
//! currently assigned to it during a run. Dirty means the change still
//! has to be committed to that peer in the write phase.

use crate::data::{Change, ChangeType};
use crate::mapping::MappingEntry;

#[derive(Debug)]
pub(crate) struct EntryEngine {
	entry: MappingEntry,
	change: Option<Change>,
	dirty: bool,
}

impl EntryEngine {
	pub fn new(entry: MappingEntry) -> Self {
		Self {
			entry,
			change: None,
			dirty: false,
		}
	}

	pub fn entry(&self) -> &MappingEntry {
		&self.entry
	}

	pub fn entry_mut(&mut self) -> &mut MappingEntry {
		&mut self.entry
	}

	pub fn change(&self) -> Option<&Change> {
		self.change.as_ref()
	}

	pub fn change_mut(&mut self) -> Option<&mut Change> {
		self.change.as_mut()
	}

	pub fn take_change(&mut self) -> Option<Change> {
		self.change.take()
	}

	pub fn set_change(&mut self, change: Option<Change>) {
		self.change = change;
	}

	pub fn change_type(&self) -> ChangeType {
		self.change
			.as_ref()
			.map(Change::change_type)
			.unwrap_or(ChangeType::Unknown)
	}

	/// Does a reported change belong to this entry? Entries without a
	/// uid never match; they await their first association.
	pub fn matches(&self, change: &Change) -> bool {
		self.entry.uid() == Some(change.uid())
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	pub fn set_dirty(&mut self, dirty: bool) {
		self.dirty = dirty;
	}
}
