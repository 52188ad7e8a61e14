//! One mapping during a sync run.
//!
//! A mapping engine carries the per-peer entry engines of one mapping,
//! the conflict flag raised while changes are matched, the winner once
//! a conflict is resolved, and the multiplication step that turns the
//! winner into per-peer dirty entries.

use super::entry_engine::EntryEngine;
use crate::data::{Change, ChangeType};
use crate::error::{SyncError, SyncResult};
use crate::format::CmpResult;
use crate::mapping::{Mapping, MappingId};
use tracing::{debug, trace};

/// Outcome of scanning a mapping for conflicting versions
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConflictCheck {
	/// No disagreement; the contained position (if any) is the winner
	Solved(Option<usize>),
	/// More than one distinct version; a resolution is required
	Conflict,
}

#[derive(Debug)]
pub(crate) struct MappingEngine {
	id: MappingId,
	/// One entry per peer, indexed by sink position
	entries: Vec<EntryEngine>,
	conflict: bool,
	synced: bool,
	/// Resolved as ignore: nothing multiplies or writes this run
	ignored: bool,
	master: Option<usize>,
}

impl MappingEngine {
	pub fn from_mapping(mapping: Mapping) -> Self {
		let id = mapping.id();
		let entries = mapping
			.entries()
			.iter()
			.cloned()
			.map(EntryEngine::new)
			.collect();
		Self {
			id,
			entries,
			conflict: false,
			synced: true,
			ignored: false,
			master: None,
		}
	}

	pub fn id(&self) -> MappingId {
		self.id
	}

	pub fn entries(&self) -> &[EntryEngine] {
		&self.entries
	}

	pub fn entry(&self, position: usize) -> &EntryEngine {
		&self.entries[position]
	}

	pub fn entry_mut(&mut self, position: usize) -> &mut EntryEngine {
		&mut self.entries[position]
	}

	pub fn has_conflict(&self) -> bool {
		self.conflict
	}

	pub fn set_conflict(&mut self, conflict: bool) {
		self.conflict = conflict;
	}

	pub fn is_synced(&self) -> bool {
		self.synced
	}

	pub fn set_synced(&mut self, synced: bool) {
		self.synced = synced;
	}

	/// Assign a change to one entry, marking the mapping unsynced.
	pub fn update_entry(&mut self, position: usize, change: Option<Change>) {
		self.entries[position].set_change(change);
		self.synced = false;
	}

	/// Positions whose entry carries an actual modification.
	pub fn changed_positions(&self) -> Vec<usize> {
		self.entries
			.iter()
			.enumerate()
			.filter(|(_, e)| {
				matches!(
					e.change_type(),
					ChangeType::Added | ChangeType::Modified | ChangeType::Deleted
				)
			})
			.map(|(p, _)| p)
			.collect()
	}

	/// Decide whether the mapping needs a conflict resolution.
	///
	/// A mapping attached through a SIMILAR comparison is conflicting
	/// by construction. Otherwise several modified entries conflict
	/// unless their payloads all compare as the same content.
	pub fn check_conflict(&self) -> SyncResult<ConflictCheck> {
		if self.ignored {
			return Ok(ConflictCheck::Solved(None));
		}
		if self.conflict {
			return Ok(ConflictCheck::Conflict);
		}

		let changed = self.changed_positions();
		match changed.len() {
			0 => Ok(ConflictCheck::Solved(None)),
			1 => Ok(ConflictCheck::Solved(Some(changed[0]))),
			_ => {
				let first = self.entries[changed[0]]
					.change()
					.expect("changed position carries a change");
				for &other in &changed[1..] {
					let candidate = self.entries[other]
						.change()
						.expect("changed position carries a change");
					if first.compare(candidate)? != CmpResult::Same {
						return Ok(ConflictCheck::Conflict);
					}
				}
				// All sides report identical content; pick one.
				Ok(ConflictCheck::Solved(Some(changed[0])))
			}
		}
	}

	/// Resolve by choosing one entry's version.
	///
	/// Idempotent: choosing the same winner twice leaves the mapping
	/// in the same state.
	pub fn solve_choose(&mut self, position: usize) {
		debug!("mapping {} solved by position {position}", self.id);
		self.master = Some(position);
		self.conflict = false;
	}

	/// Resolve by comparing format revisions; the highest wins.
	pub fn solve_use_latest(&mut self) -> SyncResult<usize> {
		let mut latest: Option<(usize, i64)> = None;

		for position in self.changed_positions() {
			let change = self.entries[position]
				.change()
				.expect("changed position carries a change");
			let data = change.data().ok_or_else(|| {
				SyncError::generic(format!(
					"no payload to take a revision from in mapping {}",
					self.id
				))
			})?;
			let revision = data.format().revision(data.bytes())?;
			trace!("mapping {}: position {position} has revision {revision}", self.id);

			match latest {
				Some((_, best)) if best >= revision => {}
				_ => latest = Some((position, revision)),
			}
		}

		let (winner, _) = latest.ok_or_else(|| {
			SyncError::generic(format!("mapping {} has no revisions to compare", self.id))
		})?;
		self.solve_choose(winner);
		Ok(winner)
	}

	/// Resolve by leaving every peer untouched this run.
	///
	/// Entries without a version get a placeholder so the mapping stays
	/// complete in memory; the caller persists the real sides to the
	/// changelog for re-injection.
	pub fn solve_ignore(&mut self, placeholder: impl Fn(&str) -> SyncResult<Change>) -> SyncResult<()> {
		for entry in &mut self.entries {
			if entry.change().is_none() {
				if let Some(uid) = entry.entry().uid().map(str::to_owned) {
					entry.set_change(Some(placeholder(&uid)?));
				}
			}
			entry.set_dirty(false);
		}
		self.ignored = true;
		self.conflict = false;
		self.master = None;
		Ok(())
	}

	/// Turn the winner into per-entry dirty changes.
	///
	/// Re-running multiplication on the same state reproduces the same
	/// dirty set: everything derives from the winner's change alone.
	pub fn multiply(&mut self) -> SyncResult<()> {
		if self.ignored {
			return Ok(());
		}

		let Some(master) = self.master else {
			return Ok(());
		};

		let winner_type = self.entries[master].change_type();
		if matches!(winner_type, ChangeType::Unmodified | ChangeType::Unknown) {
			return Ok(());
		}

		let winner_change = self.entries[master]
			.change()
			.cloned()
			.ok_or_else(|| {
				SyncError::generic(format!("winner of mapping {} lost its change", self.id))
			})?;

		for position in 0..self.entries.len() {
			if position == master {
				continue;
			}

			let entry = &mut self.entries[position];

			// An entry already holding the winner's content has nothing
			// to commit; its archive row is still refreshed during the
			// write phase. Dirty entries are always recomputed so
			// re-running multiplication reproduces the same state.
			if !entry.is_dirty() {
				if let Some(existing) = entry.change() {
					if winner_change.compare(existing)? == CmpResult::Same {
						continue;
					}
				}
			}

			let own_uid = entry.entry().uid().map(str::to_owned);

			match winner_type {
				ChangeType::Deleted => {
					// Peers that never held the record have nothing to delete.
					let Some(uid) = own_uid else {
						entry.set_change(None);
						entry.set_dirty(false);
						continue;
					};
					let mut change = Change::new(uid, ChangeType::Deleted, None)?;
					if let Some(hash) = winner_change.hash() {
						change.set_hash(hash);
					}
					entry.set_change(Some(change));
					entry.set_dirty(true);
				}
				_ => {
					let mut change = winner_change.clone();
					match own_uid {
						Some(uid) => {
							change.set_uid(uid);
							change.set_change_type(ChangeType::Modified);
						}
						None => {
							change.set_change_type(ChangeType::Added);
						}
					}
					entry.set_change(Some(change));
					entry.set_dirty(true);
				}
			}
		}

		// The winner's own entry keeps its dirty flag: normally clean,
		// already dirty for duplicates that must be written back.
		Ok(())
	}
}
