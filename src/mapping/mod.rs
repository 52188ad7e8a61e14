//! Record identity across peers.
//!
//! A mapping ties one logical record to its per-peer local uids: one
//! [`MappingEntry`] per group member, empty until the record first
//! appears on that peer. Mappings are durable in the archive; the
//! [`MappingTable`] is their in-memory shape during a sync run.

use crate::archive::Archive;
use crate::config::MemberId;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Durable identifier of a mapping within its object type
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MappingId(pub i64);

impl fmt::Display for MappingId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// One peer's slot in a mapping
#[derive(Debug, Clone)]
pub struct MappingEntry {
	/// Archive row id; 0 until first saved
	id: i64,
	member: MemberId,
	uid: Option<String>,
}

impl MappingEntry {
	pub fn new(member: MemberId) -> Self {
		Self {
			id: 0,
			member,
			uid: None,
		}
	}

	pub fn id(&self) -> i64 {
		self.id
	}

	pub fn set_id(&mut self, id: i64) {
		self.id = id;
	}

	pub fn member(&self) -> MemberId {
		self.member
	}

	pub fn uid(&self) -> Option<&str> {
		self.uid.as_deref()
	}

	pub fn set_uid(&mut self, uid: impl Into<String>) {
		self.uid = Some(uid.into());
	}

	pub fn clear_uid(&mut self) {
		self.uid = None;
	}
}

/// The identity of one logical record across all peers
#[derive(Debug, Clone)]
pub struct Mapping {
	id: MappingId,
	entries: Vec<MappingEntry>,
}

impl Mapping {
	/// A fresh mapping with one empty entry per member, in member
	/// order.
	pub fn new(id: MappingId, members: &[MemberId]) -> Self {
		Self {
			id,
			entries: members.iter().map(|m| MappingEntry::new(*m)).collect(),
		}
	}

	pub fn id(&self) -> MappingId {
		self.id
	}

	pub fn entries(&self) -> &[MappingEntry] {
		&self.entries
	}

	pub fn entry(&self, member: MemberId) -> Option<&MappingEntry> {
		self.entries.iter().find(|e| e.member == member)
	}

	pub fn entry_mut(&mut self, member: MemberId) -> Option<&mut MappingEntry> {
		self.entries.iter_mut().find(|e| e.member == member)
	}
}

/// All mappings of one object type, loaded from the archive
#[derive(Debug, Default)]
pub struct MappingTable {
	mappings: Vec<Mapping>,
}

impl MappingTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Rebuild the table from the archive's change rows.
	///
	/// Rows arrive ordered by mapping id; rows sharing an id fold into
	/// one mapping. Every mapping ends up with exactly one entry per
	/// current member: peers added to the group after a mapping was
	/// written gain an empty entry here.
	pub async fn load(
		&mut self,
		archive: &Archive,
		objtype: &str,
		members: &[MemberId],
	) -> SyncResult<()> {
		self.close();

		for row in archive.load_changes(objtype).await? {
			if self.mappings.last().map(Mapping::id) != Some(row.mapping) {
				self.mappings.push(Mapping::new(row.mapping, members));
			}
			let mapping = self.mappings.last_mut().expect("pushed above");
			let entry = mapping.entry_mut(row.member).ok_or_else(|| {
				SyncError::generic(format!(
					"archived mapping {} references member {} which left the group",
					row.mapping, row.member
				))
			})?;
			entry.set_id(row.id);
			entry.set_uid(row.uid);
		}

		debug!("loaded {} mappings for {objtype}", self.mappings.len());
		Ok(())
	}

	/// Drop the in-memory table and every archived row of `objtype`.
	/// Used on slow-sync so the run rebuilds identity from scratch.
	pub async fn flush(&mut self, archive: &Archive, objtype: &str) -> SyncResult<()> {
		self.close();
		archive.flush_changes(objtype).await
	}

	pub fn close(&mut self) {
		self.mappings.clear();
	}

	pub fn add_mapping(&mut self, mapping: Mapping) {
		self.mappings.push(mapping);
	}

	pub fn find_mapping(&self, id: MappingId) -> Option<&Mapping> {
		self.mappings.iter().find(|m| m.id() == id)
	}

	pub fn mappings(&self) -> &[Mapping] {
		&self.mappings
	}

	pub fn take_mappings(&mut self) -> Vec<Mapping> {
		std::mem::take(&mut self.mappings)
	}

	pub fn num_mappings(&self) -> usize {
		self.mappings.len()
	}

	/// Next free mapping id, starting at 1.
	pub fn next_id(&self) -> MappingId {
		MappingId(
			self.mappings
				.iter()
				.map(|m| m.id().0)
				.max()
				.unwrap_or(0)
				+ 1,
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn members() -> Vec<MemberId> {
		vec![MemberId(1), MemberId(2)]
	}

	#[test]
	fn next_id_grows_from_one() {
		let mut table = MappingTable::new();
		assert_eq!(table.next_id(), MappingId(1));

		table.add_mapping(Mapping::new(MappingId(1), &members()));
		table.add_mapping(Mapping::new(MappingId(7), &members()));
		assert_eq!(table.next_id(), MappingId(8));
	}

	#[test]
	fn mapping_holds_one_entry_per_member() {
		let mapping = Mapping::new(MappingId(1), &members());
		assert_eq!(mapping.entries().len(), 2);
		assert!(mapping.entry(MemberId(2)).is_some());
		assert!(mapping.entry(MemberId(3)).is_none());
		assert!(mapping.entries().iter().all(|e| e.uid().is_none()));
	}
}
