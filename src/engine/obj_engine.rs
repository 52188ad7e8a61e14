//! Per-object-type phase machine.
//!
//! An object engine drives every peer's sink for one object type
//! through the run: it fans a phase out as one proxy call per sink,
//! counts acknowledgements in per-phase bitmasks keyed by sink
//! position, and raises the phase event once every active sink
//! acknowledged or errored. Between reading and writing it owns the
//! mapping work: matching reported changes into mappings, surfacing
//! conflicts and multiplying resolved winners.

use super::command::Resolution;
use super::entry_engine::EntryEngine;
use super::mapping_engine::{ConflictCheck, MappingEngine};
use super::resolver::{ConflictEntry, ConflictView, MemberSummary};
use super::sink_engine::SinkEngine;
use crate::archive::Archive;
use crate::config::{Group, MemberId};
use crate::data::{Change, ChangeType, Data};
use crate::error::{SyncError, SyncResult};
use crate::format::{Capabilities, CmpResult, FormatRegistry, PlainFormat};
use crate::infrastructure::events::{
	ChangeEvent, EngineEvent, EventBus, MappingEvent, MemberEvent, SyncEvent,
};
use crate::mapping::{Mapping, MappingId, MappingTable};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Shared context the driver lends to object engine operations
pub(crate) struct ObjCtx<'a> {
	pub group: &'a Group,
	pub registry: Arc<FormatRegistry>,
	pub archive: Arc<Archive>,
	pub events: Arc<EventBus>,
}

/// Phases an object engine issues to its sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjCommand {
	Connect,
	ConnectDone,
	Read,
	PrepareMap,
	Map,
	EndConflicts,
	Multiply,
	PrepareWrite,
	Write,
	SyncDone,
	Disconnect,
}

/// Acknowledged sink phases, one bitmask each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SinkPhase {
	Connect,
	ConnectDone,
	GetChanges,
	Written,
	SyncDone,
	Disconnect,
}

/// A proxy call the driver must issue on this engine's behalf
#[derive(Debug)]
pub(crate) enum ProxyCall {
	Connect { member: MemberId },
	ConnectDone { member: MemberId },
	GetChanges { member: MemberId },
	ReadIgnored { member: MemberId, mapping: MappingId, change: Change },
	Commit { member: MemberId, mapping: MappingId, change: Change },
	CommittedAll { member: MemberId },
	SyncDone { member: MemberId },
	Disconnect { member: MemberId },
}

/// An event this engine raises towards the group engine
#[derive(Debug)]
pub(crate) struct ObjEvent {
	pub event: EngineEvent,
	pub error: Option<SyncError>,
}

/// Everything one command produced
#[derive(Debug, Default)]
pub(crate) struct CommandOutcome {
	pub calls: Vec<ProxyCall>,
	pub events: Vec<ObjEvent>,
	/// Conflicts the driver must hand to the resolver
	pub conflicts: Vec<ConflictView>,
}

impl CommandOutcome {
	fn push_event(&mut self, event: EngineEvent, error: Option<SyncError>) {
		self.events.push(ObjEvent { event, error });
	}
}

pub(crate) struct ObjEngine {
	objtype: String,
	slow_sync: bool,
	written: bool,
	conflicts_solved: bool,
	sinks: Vec<SinkEngine>,
	active_mask: u64,
	mapping_table: MappingTable,
	mappings: Vec<MappingEngine>,
	next_mapping_id: i64,
	/// Re-reads of injected entries still outstanding; the read phase
	/// does not end before they are answered
	pending_hydrations: usize,
	error: Option<SyncError>,

	sink_errors: u64,
	sink_connects: u64,
	sink_connect_done: u64,
	sink_get_changes: u64,
	sink_written: u64,
	sink_sync_done: u64,
	sink_disconnects: u64,
}

fn bit(position: usize) -> u64 {
	1 << position
}

fn member_caps<'a>(ctx: &'a ObjCtx<'_>, member: MemberId) -> Option<&'a Capabilities> {
	if !ctx.group.merger_enabled {
		return None;
	}
	ctx.group.member(member).and_then(|m| m.capabilities.as_ref())
}

/// Clone a change with the fields the peer cannot hold stripped off,
/// so payloads compare on common ground.
fn demerged_clone(change: &Change, caps: Option<&Capabilities>) -> SyncResult<Change> {
	let Some(caps) = caps else {
		return Ok(change.clone());
	};
	let Some(data) = change.data() else {
		return Ok(change.clone());
	};
	if !data.format().has_merger() {
		return Ok(change.clone());
	}

	let stripped = data.format().demerge(data.bytes(), caps)?;
	let mut clone = change.clone();
	clone
		.data_mut()
		.expect("cloned change keeps its payload")
		.set_bytes(stripped);
	Ok(clone)
}

impl ObjEngine {
	pub fn new(objtype: impl Into<String>) -> Self {
		Self {
			objtype: objtype.into(),
			slow_sync: false,
			written: false,
			conflicts_solved: false,
			sinks: Vec::new(),
			active_mask: 0,
			mapping_table: MappingTable::new(),
			mappings: Vec::new(),
			next_mapping_id: 1,
			pending_hydrations: 0,
			error: None,
			sink_errors: 0,
			sink_connects: 0,
			sink_connect_done: 0,
			sink_get_changes: 0,
			sink_written: 0,
			sink_sync_done: 0,
			sink_disconnects: 0,
		}
	}

	pub fn objtype(&self) -> &str {
		&self.objtype
	}

	pub fn slow_sync(&self) -> bool {
		self.slow_sync
	}

	pub fn set_slow_sync(&mut self, slow_sync: bool) {
		self.slow_sync = slow_sync;
	}

	/// Stick a new error on the engine, keeping older ones as causes.
	pub fn set_error(&mut self, error: SyncError) {
		self.error = Some(match self.error.take() {
			Some(previous) => error.stack(previous),
			None => error,
		});
	}

	pub fn members(&self) -> Vec<MemberId> {
		self.sinks.iter().map(SinkEngine::member).collect()
	}

	fn position_of(&self, member: MemberId) -> Option<usize> {
		self.sinks.iter().position(|s| s.member() == member)
	}

	fn covers_active(&self, mask: u64) -> bool {
		(mask | self.sink_errors) & self.active_mask == self.active_mask
	}

	pub fn is_connected(&self, position: usize) -> bool {
		self.sink_connects & bit(position) != 0
	}

	pub fn pending_conflicts(&self) -> usize {
		self.mappings.iter().filter(|m| m.has_conflict()).count()
	}

	/// Build per-run state: sink engines, the mapping table and the
	/// runtime mapping engines, plus re-injected ignored conflicts.
	pub async fn initialize(&mut self, ctx: &ObjCtx<'_>) -> SyncResult<()> {
		self.sinks.clear();
		self.active_mask = 0;

		for (position, member) in ctx.group.members.iter().enumerate() {
			let sink = member.sink(&self.objtype);
			let active = sink.is_some();
			let writable = sink.map(|s| s.write).unwrap_or(false);
			if active {
				self.active_mask |= bit(position);
			}
			self.sinks
				.push(SinkEngine::new(position, member.id, active, writable));
		}

		if self.slow_sync {
			debug!("slow sync: flushing mappings for {}", self.objtype);
			self.mapping_table.flush(&ctx.archive, &self.objtype).await?;
		}

		let members = self.members();
		self.mapping_table
			.load(&ctx.archive, &self.objtype, &members)
			.await?;

		self.mappings = self
			.mapping_table
			.take_mappings()
			.into_iter()
			.map(MappingEngine::from_mapping)
			.collect();
		self.next_mapping_id = self
			.mappings
			.iter()
			.map(|m| m.id().0)
			.max()
			.unwrap_or(0)
			+ 1;

		debug!(
			"initialized {} with {} mappings across {} peers",
			self.objtype,
			self.mappings.len(),
			self.sinks.len()
		);

		self.inject_ignored_conflicts(ctx).await?;

		Ok(())
	}

	/// Re-attach conflicts ignored in a previous run so multiplication
	/// picks them up again.
	async fn inject_ignored_conflicts(&mut self, ctx: &ObjCtx<'_>) -> SyncResult<()> {
		for ignored in ctx.archive.load_ignored_conflicts(&self.objtype).await? {
			let Some(position) = self.position_of(ignored.member) else {
				warn!(
					"changelog references member {} unknown to {}",
					ignored.member, self.objtype
				);
				continue;
			};
			let Some(mapping) = self.mappings.iter_mut().find(|m| m.id() == ignored.mapping)
			else {
				warn!(
					"changelog references mapping {} unknown to {}",
					ignored.mapping, self.objtype
				);
				continue;
			};

			let entry = mapping.entry(position);
			let Some(uid) = entry.entry().uid().map(str::to_owned) else {
				continue;
			};

			let data = Data::new(Vec::new(), PlainFormat::for_objtype(self.objtype.as_str()));
			let mut change = Change::new(uid, ignored.change_type, Some(data))?;
			if ignored.change_type == ChangeType::Deleted {
				change.set_data(None);
			}
			trace!(
				"re-injecting ignored {} change into mapping {}",
				ignored.change_type,
				ignored.mapping
			);
			mapping.update_entry(position, Some(change));
		}
		Ok(())
	}

	/// Drop all per-run state. The engine survives for the next run.
	pub fn finalize(&mut self) {
		self.slow_sync = false;
		self.written = false;
		self.conflicts_solved = false;

		self.sink_errors = 0;
		self.sink_connects = 0;
		self.sink_connect_done = 0;
		self.sink_get_changes = 0;
		self.sink_written = 0;
		self.sink_sync_done = 0;
		self.sink_disconnects = 0;

		for sink in &mut self.sinks {
			sink.reset();
		}
		self.sinks.clear();
		self.active_mask = 0;
		self.mappings.clear();
		self.mapping_table.close();
		self.pending_hydrations = 0;
		self.error = None;
	}

	/// Execute one phase command, producing the proxy calls to issue
	/// and any events that are already decidable.
	pub async fn command(
		&mut self,
		cmd: ObjCommand,
		ctx: &ObjCtx<'_>,
	) -> SyncResult<CommandOutcome> {
		trace!("{}: command {:?}", self.objtype, cmd);
		let mut outcome = CommandOutcome::default();

		match cmd {
			ObjCommand::Connect => {
				for sink in self.sinks.iter().filter(|s| s.is_active()) {
					outcome.calls.push(ProxyCall::Connect {
						member: sink.member(),
					});
				}
				self.finish_phase(SinkPhase::Connect, &mut outcome);
			}
			ObjCommand::ConnectDone => {
				for sink in self.sinks.iter().filter(|s| s.is_active()) {
					outcome.calls.push(ProxyCall::ConnectDone {
						member: sink.member(),
					});
				}
				self.finish_phase(SinkPhase::ConnectDone, &mut outcome);
			}
			ObjCommand::Read => {
				// Re-hydrate entries injected from the ignored-conflict log.
				let mut hydrations = 0;
				for sink in self.sinks.iter().filter(|s| s.is_active()) {
					for mapping in &self.mappings {
						let entry = mapping.entry(sink.position());
						if let Some(change) = entry.change() {
							outcome.calls.push(ProxyCall::ReadIgnored {
								member: sink.member(),
								mapping: mapping.id(),
								change: change.clone(),
							});
							hydrations += 1;
						}
					}
				}
				self.pending_hydrations = hydrations;

				// Flushed now that the entries are back in memory, so
				// they are not injected twice.
				ctx.archive.flush_ignored_conflicts(&self.objtype).await?;

				let write_sinks = self.sinks.iter().filter(|s| s.is_writable()).count();

				for position in 0..self.sinks.len() {
					if !self.sinks[position].is_active() {
						continue;
					}
					let member = self.sinks[position].member();

					// With at most one writable destination there is
					// nobody to forward changes to.
					let skip = write_sinks == 0
						|| (write_sinks == 1 && self.sinks[position].is_writable());
					if skip {
						trace!(
							"{}: skipping get_changes for member {member}, nothing to forward",
							self.objtype
						);
						self.sink_get_changes |= bit(position);
						ctx.events.emit(SyncEvent::Member {
							member,
							objtype: Some(self.objtype.clone()),
							event: MemberEvent::Read,
							error: None,
						});
						continue;
					}

					outcome.calls.push(ProxyCall::GetChanges { member });
				}
				self.finish_phase(SinkPhase::GetChanges, &mut outcome);
			}
			ObjCommand::PrepareMap => {
				// Reserved for conversion before mapping.
				outcome.push_event(EngineEvent::PreparedMap, None);
			}
			ObjCommand::Map => {
				let result = self
					.map_changes(ctx)
					.and_then(|()| self.collect_conflicts());
				match result {
					Ok(conflicts) => {
						outcome.conflicts = conflicts;
						outcome.push_event(EngineEvent::Mapped, None);
					}
					Err(err) => {
						self.set_error(err.clone());
						outcome.push_event(EngineEvent::Mapped, Some(err));
					}
				}
			}
			ObjCommand::EndConflicts => {
				let pending = self.pending_conflicts();
				if pending > 0 {
					debug!("{}: {pending} conflicts still pending", self.objtype);
				} else if !self.conflicts_solved {
					self.conflicts_solved = true;
					outcome.push_event(EngineEvent::EndConflicts, None);
				}
			}
			ObjCommand::Multiply => {
				let mut failure = None;
				for mapping in &mut self.mappings {
					if let Err(err) = mapping.multiply() {
						failure = Some(err);
						break;
					}
				}
				if let Some(err) = &failure {
					self.set_error(err.clone());
				}
				outcome.push_event(EngineEvent::Multiplied, failure);
			}
			ObjCommand::PrepareWrite => {
				let result = self.prepare_write(ctx).await;
				let error = result.err();
				if let Some(err) = &error {
					self.set_error(err.clone());
				}
				outcome.push_event(EngineEvent::PreparedWrite, error);
			}
			ObjCommand::Write => {
				if self.pending_conflicts() > 0 {
					debug!("{}: conflicts pending, delaying write", self.objtype);
				} else if self.written {
					trace!("{}: already written", self.objtype);
				} else {
					self.written = true;
					self.build_write_calls(ctx, &mut outcome).await?;
					self.finish_write(&mut outcome);
				}
			}
			ObjCommand::SyncDone => {
				for sink in self.sinks.iter().filter(|s| s.is_active()) {
					outcome.calls.push(ProxyCall::SyncDone {
						member: sink.member(),
					});
				}
				self.finish_phase(SinkPhase::SyncDone, &mut outcome);
			}
			ObjCommand::Disconnect => {
				for position in 0..self.sinks.len() {
					if !self.sinks[position].is_active() || !self.is_connected(position) {
						continue;
					}
					outcome.calls.push(ProxyCall::Disconnect {
						member: self.sinks[position].member(),
					});
				}
				// Peers that never connected see no disconnect call;
				// without any call the event must be raised here.
				if outcome.calls.is_empty() {
					self.finish_phase(SinkPhase::Disconnect, &mut outcome);
				}
			}
		}

		Ok(outcome)
	}

	/// Record one sink acknowledgement and raise the phase event when
	/// this was the last outstanding sink.
	pub fn handle_sink_ack(
		&mut self,
		member: MemberId,
		phase: SinkPhase,
		error: Option<SyncError>,
		events: &EventBus,
	) -> Option<ObjEvent> {
		let Some(position) = self.position_of(member) else {
			warn!("{}: ack from unknown member {member}", self.objtype);
			return None;
		};

		match error {
			Some(err) => {
				self.set_error(err.clone());
				self.sink_errors |= bit(position);
				events.emit(SyncEvent::Member {
					member,
					objtype: Some(self.objtype.clone()),
					event: MemberEvent::Error,
					error: Some(err),
				});
			}
			None => {
				let (mask, member_event) = match phase {
					SinkPhase::Connect => (&mut self.sink_connects, MemberEvent::Connected),
					SinkPhase::ConnectDone => {
						(&mut self.sink_connect_done, MemberEvent::ConnectDone)
					}
					SinkPhase::GetChanges => (&mut self.sink_get_changes, MemberEvent::Read),
					SinkPhase::Written => (&mut self.sink_written, MemberEvent::Written),
					SinkPhase::SyncDone => (&mut self.sink_sync_done, MemberEvent::SyncDone),
					SinkPhase::Disconnect => {
						(&mut self.sink_disconnects, MemberEvent::Disconnected)
					}
				};
				*mask |= bit(position);
				events.emit(SyncEvent::Member {
					member,
					objtype: Some(self.objtype.clone()),
					event: member_event,
					error: None,
				});
			}
		}

		let mut outcome = CommandOutcome::default();
		self.finish_phase(phase, &mut outcome);
		outcome.events.pop()
	}

	/// Evaluate phase completion; pushes the phase event when every
	/// active sink has answered.
	fn finish_phase(&mut self, phase: SinkPhase, outcome: &mut CommandOutcome) {
		let (mask, event) = match phase {
			SinkPhase::Connect => (self.sink_connects, EngineEvent::Connected),
			SinkPhase::ConnectDone => (self.sink_connect_done, EngineEvent::ConnectDone),
			SinkPhase::GetChanges => {
				if self.pending_hydrations > 0 {
					trace!(
						"{}: {} injected entries still re-reading",
						self.objtype,
						self.pending_hydrations
					);
					return;
				}
				(self.sink_get_changes, EngineEvent::Read)
			}
			SinkPhase::Written => {
				self.finish_write(outcome);
				return;
			}
			SinkPhase::SyncDone => (self.sink_sync_done, EngineEvent::SyncDone),
			SinkPhase::Disconnect => (self.sink_disconnects, EngineEvent::Disconnected),
		};

		if !self.covers_active(mask) {
			trace!(
				"{}: phase {:?} not complete yet ({:#b})",
				self.objtype,
				phase,
				mask | self.sink_errors
			);
			return;
		}

		if phase == SinkPhase::Disconnect {
			// Disconnect failures do not endanger data integrity; they
			// stay local to this engine and never travel up.
			if (self.sink_disconnects & self.active_mask).count_ones()
				< (self.sink_connects & self.active_mask).count_ones()
			{
				self.set_error(SyncError::generic(format!(
					"fewer {} peers disconnected than connected",
					self.objtype
				)));
			}
			outcome.push_event(EngineEvent::Disconnected, None);
			return;
		}

		let error = if self.sink_errors & self.active_mask != 0 {
			let err = SyncError::generic(format!(
				"at least one peer failed during {} of {}",
				event, self.objtype
			));
			self.set_error(err.clone());
			Some(err)
		} else {
			None
		};

		outcome.push_event(event, error);
	}

	/// The write phase ends once nothing is dirty anymore and every
	/// active sink acknowledged committed-all.
	fn finish_write(&mut self, outcome: &mut CommandOutcome) {
		let still_dirty = self
			.mappings
			.iter()
			.any(|m| m.entries().iter().any(EntryEngine::is_dirty));
		if still_dirty {
			trace!("{}: still dirty", self.objtype);
			return;
		}

		if !self.covers_active(self.sink_written) {
			return;
		}

		let error = if self.sink_errors & self.active_mask != 0 {
			let err = SyncError::generic(format!(
				"at least one peer failed while committing {}",
				self.objtype
			));
			self.set_error(err.clone());
			Some(err)
		} else {
			None
		};

		outcome.push_event(EngineEvent::Written, error);
	}

	/// Route one change reported during get-changes.
	pub fn receive_change(
		&mut self,
		member: MemberId,
		change: Change,
		ctx: &ObjCtx<'_>,
	) -> SyncResult<()> {
		let position = self.position_of(member).ok_or_else(|| {
			SyncError::generic(format!(
				"change for {} from member {member} outside the group",
				self.objtype
			))
		})?;

		// Known uid: the change belongs to an existing mapping.
		for mapping in &mut self.mappings {
			if mapping.entry(position).matches(&change) {
				ctx.events.emit(SyncEvent::Change {
					member,
					objtype: self.objtype.clone(),
					uid: change.uid().to_owned(),
					mapping: Some(mapping.id()),
					event: ChangeEvent::Read,
					error: None,
				});
				mapping.update_entry(position, Some(change));
				return Ok(());
			}
		}

		ctx.events.emit(SyncEvent::Change {
			member,
			objtype: self.objtype.clone(),
			uid: change.uid().to_owned(),
			mapping: None,
			event: ChangeEvent::Read,
			error: None,
		});
		self.sinks[position].push_unmapped(change);
		Ok(())
	}

	fn fresh_mapping(&mut self) -> usize {
		let id = MappingId(self.next_mapping_id);
		self.next_mapping_id += 1;
		let members = self.members();
		self.mappings
			.push(MappingEngine::from_mapping(Mapping::new(id, &members)));
		self.mappings.len() - 1
	}

	/// Compare an unmapped change against one attached entry, demerging
	/// both sides through the other peer's capabilities when mergers
	/// are in play.
	fn compare_unmapped(
		&self,
		ctx: &ObjCtx<'_>,
		change: &Change,
		own_member: MemberId,
		candidate: &Change,
		candidate_member: MemberId,
	) -> SyncResult<CmpResult> {
		let own_caps = member_caps(ctx, own_member);
		let candidate_caps = member_caps(ctx, candidate_member);

		let left = demerged_clone(change, candidate_caps)?;
		let right = demerged_clone(candidate, own_caps)?;
		left.compare(&right)
	}

	/// Place every unmapped change into a mapping.
	///
	/// Candidates are only the mappings created during this pass:
	/// anything older was already matched by uid when the change
	/// arrived. A SAME comparison wins over SIMILAR; a SAME match for
	/// a slot already holding a SIMILAR attachment pushes the older
	/// change out into a fresh mapping.
	fn map_changes(&mut self, ctx: &ObjCtx<'_>) -> SyncResult<()> {
		let mut created: Vec<usize> = Vec::new();

		for position in 0..self.sinks.len() {
			let member = self.sinks[position].member();
			let mut candidates: Vec<usize> = created.clone();

			while let Some(change) = self.sinks[position].pop_unmapped() {
				trace!(
					"{}: mapping change {} ({}) from member {member}",
					self.objtype,
					change.uid(),
					change.change_type()
				);

				let mut best: Option<(usize, CmpResult)> = None;
				'candidates: for &idx in &candidates {
					for entry_pos in 0..self.mappings[idx].entries().len() {
						if entry_pos == position {
							continue;
						}
						let Some(candidate) = self.mappings[idx].entry(entry_pos).change()
						else {
							continue;
						};
						let candidate_member =
							self.mappings[idx].entry(entry_pos).entry().member();

						match self.compare_unmapped(
							ctx,
							&change,
							member,
							candidate,
							candidate_member,
						)? {
							CmpResult::Same => {
								best = Some((idx, CmpResult::Same));
								break 'candidates;
							}
							CmpResult::Similar if best.is_none() => {
								best = Some((idx, CmpResult::Similar));
							}
							_ => {}
						}
					}
				}

				let target = match best {
					Some((idx, CmpResult::Same)) => {
						self.mappings[idx].set_conflict(false);
						candidates.retain(|&c| c != idx);
						idx
					}
					Some((idx, _)) => {
						self.mappings[idx].set_conflict(true);
						idx
					}
					None => {
						let idx = self.fresh_mapping();
						debug!(
							"{}: no mapping found, created {}",
							self.objtype,
							self.mappings[idx].id()
						);
						created.push(idx);
						candidates.push(idx);
						idx
					}
				};

				// A SIMILAR attachment may already occupy our slot; it
				// loses to the incoming change and moves out.
				if let Some(old) = self.mappings[target].entry_mut(position).take_change() {
					let moved = self.fresh_mapping();
					created.push(moved);
					candidates.push(moved);
					self.mappings[moved].update_entry(position, Some(old));
				}

				self.mappings[target].update_entry(position, Some(change));
			}
		}

		Ok(())
	}

	/// Decide a winner for every unsynced mapping; return the mappings
	/// that need a resolver.
	fn collect_conflicts(&mut self) -> SyncResult<Vec<ConflictView>> {
		let mut conflicts = Vec::new();

		for idx in 0..self.mappings.len() {
			if self.mappings[idx].is_synced() {
				continue;
			}
			match self.mappings[idx].check_conflict()? {
				ConflictCheck::Solved(Some(master)) => {
					self.mappings[idx].solve_choose(master);
				}
				ConflictCheck::Solved(None) => {}
				ConflictCheck::Conflict => {
					self.mappings[idx].set_conflict(true);
					conflicts.push(self.conflict_view(idx));
				}
			}
		}

		if !conflicts.is_empty() {
			debug!("{}: {} conflicting mappings", self.objtype, conflicts.len());
		}
		Ok(conflicts)
	}

	fn conflict_view(&self, idx: usize) -> ConflictView {
		let mapping = &self.mappings[idx];
		ConflictView {
			objtype: self.objtype.clone(),
			mapping: mapping.id(),
			entries: mapping
				.entries()
				.iter()
				.map(|entry| ConflictEntry {
					member: entry.entry().member(),
					uid: entry
						.change()
						.map(|c| c.uid().to_owned())
						.or_else(|| entry.entry().uid().map(str::to_owned)),
					change_type: entry.change_type(),
					payload: entry
						.change()
						.and_then(Change::data)
						.map(|d| d.bytes().to_vec()),
				})
				.collect(),
		}
	}

	/// Apply one resolution to a conflicting mapping.
	pub async fn solve(
		&mut self,
		mapping_id: MappingId,
		resolution: Resolution,
		ctx: &ObjCtx<'_>,
	) -> SyncResult<()> {
		let idx = self
			.mappings
			.iter()
			.position(|m| m.id() == mapping_id)
			.ok_or_else(|| {
				SyncError::generic(format!(
					"no mapping {mapping_id} in {} to solve",
					self.objtype
				))
			})?;

		match resolution {
			Resolution::Choose { member } => {
				let position = self.position_of(member).ok_or_else(|| {
					SyncError::generic(format!("member {member} is not part of {}", self.objtype))
				})?;
				if self.mappings[idx].entry(position).change().is_none() {
					return Err(SyncError::generic(format!(
						"member {member} has no version of mapping {mapping_id} to choose"
					)));
				}
				self.mappings[idx].solve_choose(position);
			}
			Resolution::UseLatest => {
				self.mappings[idx].solve_use_latest()?;
			}
			Resolution::Duplicate => {
				self.solve_duplicate(idx)?;
			}
			Resolution::Ignore => {
				self.solve_ignore(idx, ctx).await?;
			}
		}

		ctx.events.emit(SyncEvent::Mapping {
			objtype: self.objtype.clone(),
			mapping: mapping_id,
			event: MappingEvent::Solved,
			error: None,
		});
		Ok(())
	}

	/// Keep the first version in place and spin every other version
	/// out into its own mapping under a fresh uid.
	fn solve_duplicate(&mut self, idx: usize) -> SyncResult<()> {
		let changed = self.mappings[idx].changed_positions();
		let Some((&master, losers)) = changed.split_first() else {
			return Err(SyncError::generic(format!(
				"nothing to duplicate in mapping {}",
				self.mappings[idx].id()
			)));
		};

		for &position in losers {
			let Some(change) = self.mappings[idx].entry_mut(position).take_change() else {
				continue;
			};
			let data = change.data().ok_or_else(|| {
				SyncError::generic(format!("no payload to duplicate for {}", change.uid()))
			})?;
			let format = data.format().clone();
			let duplicated = format.duplicate(change.uid(), data.bytes())?;

			let new_idx = self.fresh_mapping();
			let mut fresh = Change::new(
				duplicated.uid,
				ChangeType::Added,
				Some(Data::new(duplicated.bytes, format)),
			)?;
			if let Some(hash) = change.hash() {
				fresh.set_hash(hash);
			}
			self.mappings[new_idx].update_entry(position, Some(fresh));
			self.mappings[new_idx]
				.entry_mut(position)
				.set_dirty(duplicated.dirty);
			self.mappings[new_idx].solve_choose(position);
		}

		self.mappings[idx].solve_choose(master);
		Ok(())
	}

	/// Leave both sides untouched this run and remember them in the
	/// changelog for the next one.
	async fn solve_ignore(&mut self, idx: usize, ctx: &ObjCtx<'_>) -> SyncResult<()> {
		let mapping_id = self.mappings[idx].id();

		for entry in self.mappings[idx].entries() {
			let Some(change) = entry.change() else {
				continue;
			};
			ctx.archive
				.save_ignored_conflict(
					&self.objtype,
					entry.entry().member(),
					mapping_id,
					change.change_type(),
				)
				.await?;
		}

		let objtype = self.objtype.clone();
		self.mappings[idx].solve_ignore(|uid| {
			Change::new(
				uid,
				ChangeType::Unknown,
				Some(Data::new(Vec::new(), PlainFormat::for_objtype(objtype.as_str()))),
			)
		})?;
		Ok(())
	}

	/// Demerge payloads into the archive and convert everything pending
	/// into formats the destination peers accept.
	async fn prepare_write(&mut self, ctx: &ObjCtx<'_>) -> SyncResult<()> {
		let objtype = self.objtype.clone();
		let Self {
			sinks, mappings, ..
		} = self;

		for sink in sinks.iter_mut() {
			if !sink.is_active() {
				continue;
			}
			let Some(member) = ctx.group.member(sink.member()) else {
				continue;
			};

			if ctx.group.merger_enabled {
				if let Some(caps) = &member.capabilities {
					sink.demerge(mappings, &ctx.archive, caps).await?;
				}
			}

			if ctx.group.converter_enabled {
				if let Some(sink_config) = member.sink(&objtype) {
					sink.convert_to_dest(mappings, &ctx.registry, sink_config)?;
				}
			}
		}

		Ok(())
	}

	/// Build the commit calls of the write phase and update archive
	/// rows for everything that stays clean.
	async fn build_write_calls(
		&mut self,
		ctx: &ObjCtx<'_>,
		outcome: &mut CommandOutcome,
	) -> SyncResult<()> {
		for position in 0..self.sinks.len() {
			let member = self.sinks[position].member();
			let member_config = ctx.group.member(member);
			let writable = self.sinks[position].is_writable();
			let dummy = !self.sinks[position].is_active();

			for mapping_idx in 0..self.mappings.len() {
				let mapping_id = self.mappings[mapping_idx].id();
				let entry = self.mappings[mapping_idx].entry_mut(position);

				if entry.is_dirty() {
					let Some(change) = entry.change() else {
						entry.set_dirty(false);
						continue;
					};

					// Entries parked on a dummy sink can still be
					// written when the peer has a sink for the
					// change's actual object type.
					let target_writable = if dummy {
						change
							.objtype()
							.and_then(|objtype| {
								member_config.and_then(|m| m.sink(objtype))
							})
							.map(|s| s.write)
							.unwrap_or(false)
					} else {
						writable
					};

					if !target_writable {
						trace!(
							"{}: member {member} cannot store {}, skipping",
							self.objtype,
							change.uid()
						);
						entry.set_dirty(false);
						continue;
					}

					outcome.calls.push(ProxyCall::Commit {
						member,
						mapping: mapping_id,
						change: change.clone(),
					});
				} else if let Some(change) = entry.change() {
					let objtype = change.objtype().unwrap_or(&self.objtype).to_owned();
					if change.change_type() == ChangeType::Deleted {
						ctx.archive.delete_change(entry.entry().id(), &objtype).await?;
					} else {
						let id = ctx
							.archive
							.save_change(
								entry.entry().id(),
								change.uid(),
								&objtype,
								mapping_id,
								member,
								&self.objtype,
							)
							.await?;
						let entry = self.mappings[mapping_idx].entry_mut(position);
						entry.entry_mut().set_id(id);
					}
				}
			}
		}

		for sink in self.sinks.iter().filter(|s| s.is_active()) {
			outcome.calls.push(ProxyCall::CommittedAll {
				member: sink.member(),
			});
		}

		Ok(())
	}

	/// Process the answer to one commit call.
	pub async fn handle_commit_ack(
		&mut self,
		member: MemberId,
		mapping_id: MappingId,
		result: SyncResult<Option<String>>,
		ctx: &ObjCtx<'_>,
	) -> Option<ObjEvent> {
		let Some(position) = self.position_of(member) else {
			warn!("{}: commit ack from unknown member {member}", self.objtype);
			return None;
		};
		let Some(mapping_idx) = self.mappings.iter().position(|m| m.id() == mapping_id)
		else {
			warn!("{}: commit ack for unknown mapping {mapping_id}", self.objtype);
			return None;
		};

		let entry = self.mappings[mapping_idx].entry_mut(position);
		entry.set_dirty(false);

		match result {
			Err(err) => {
				let uid = entry
					.change()
					.map(|c| c.uid().to_owned())
					.unwrap_or_default();
				ctx.events.emit(SyncEvent::Change {
					member,
					objtype: self.objtype.clone(),
					uid,
					mapping: Some(mapping_id),
					event: ChangeEvent::Error,
					error: Some(err.clone()),
				});
				ctx.events.emit(SyncEvent::Mapping {
					objtype: self.objtype.clone(),
					mapping: mapping_id,
					event: MappingEvent::Error,
					error: Some(err.clone()),
				});
				self.set_error(err);
				self.sink_errors |= bit(position);
			}
			Ok(new_uid) => {
				if let Some(uid) = new_uid {
					if let Some(change) = entry.change_mut() {
						change.set_uid(uid);
					}
				}

				let (uid, change_type, objtype) = {
					let change = entry.change().expect("dirty entries carry changes");
					(
						change.uid().to_owned(),
						change.change_type(),
						change.objtype().unwrap_or(&self.objtype).to_owned(),
					)
				};

				let archive_result = if change_type == ChangeType::Deleted {
					entry.entry_mut().clear_uid();
					ctx.archive.delete_change(entry.entry().id(), &objtype).await
				} else {
					entry.entry_mut().set_uid(uid.as_str());
					match ctx
						.archive
						.save_change(
							entry.entry().id(),
							&uid,
							&objtype,
							mapping_id,
							member,
							&self.objtype,
						)
						.await
					{
						Ok(id) => {
							let entry = self.mappings[mapping_idx].entry_mut(position);
							entry.entry_mut().set_id(id);
							Ok(())
						}
						Err(err) => Err(err),
					}
				};

				if let Err(err) = archive_result {
					self.set_error(err);
					self.sink_errors |= bit(position);
				} else {
					ctx.events.emit(SyncEvent::Change {
						member,
						objtype: self.objtype.clone(),
						uid,
						mapping: Some(mapping_id),
						event: ChangeEvent::Written,
						error: None,
					});
				}

				self.mappings[mapping_idx]
					.entry_mut(position)
					.set_change(None);
				self.mappings[mapping_idx].set_synced(true);
			}
		}

		let mut outcome = CommandOutcome::default();
		self.finish_write(&mut outcome);
		outcome.events.pop()
	}

	/// Replace an injected placeholder with the payload the peer read
	/// back. Failures are tolerated; the entry keeps its placeholder.
	pub fn handle_read_hydrated(
		&mut self,
		member: MemberId,
		mapping_id: MappingId,
		result: SyncResult<Change>,
	) -> Option<ObjEvent> {
		self.pending_hydrations = self.pending_hydrations.saturating_sub(1);

		let position = self.position_of(member);
		let mapping = self.mappings.iter_mut().find(|m| m.id() == mapping_id);
		match (position, mapping, result) {
			(Some(position), Some(mapping), Ok(change)) => {
				mapping.update_entry(position, Some(change));
			}
			(_, _, Err(err)) => warn!(
				"{}: member {member} could not re-read mapping {mapping_id}: {err}",
				self.objtype
			),
			_ => warn!(
				"{}: stray re-read answer for mapping {mapping_id}",
				self.objtype
			),
		}

		// The last hydration may have been what the read phase was
		// waiting for.
		let mut outcome = CommandOutcome::default();
		self.finish_phase(SinkPhase::GetChanges, &mut outcome);
		outcome.events.pop()
	}

	/// Dirty-entry counts per member, for the multiply summary.
	pub fn member_summaries(&self) -> Vec<MemberSummary> {
		self.sinks
			.iter()
			.map(|sink| {
				let mut summary = MemberSummary {
					member: sink.member(),
					..MemberSummary::default()
				};
				for mapping in &self.mappings {
					let entry = mapping.entry(sink.position());
					if !entry.is_dirty() {
						continue;
					}
					match entry.change_type() {
						ChangeType::Added => summary.added += 1,
						ChangeType::Modified => summary.modified += 1,
						ChangeType::Deleted => summary.deleted += 1,
						ChangeType::Unmodified => summary.unmodified += 1,
						ChangeType::Unknown => summary.unknown += 1,
					}
				}
				summary
			})
			.collect()
	}

}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{MemberConfig, SinkConfig};
	use crate::infrastructure::events::EventBus;
	use std::sync::Arc;
	use tempfile::TempDir;

	/// Compares payloads as Same on full equality and Similar when
	/// only the first byte matches.
	struct LooseFormat;

	impl crate::format::ObjectFormat for LooseFormat {
		fn name(&self) -> &str {
			"loose"
		}

		fn objtype(&self) -> &str {
			"contact"
		}

		fn compare(&self, left: &[u8], right: &[u8]) -> SyncResult<CmpResult> {
			if left == right {
				Ok(CmpResult::Same)
			} else if left.first() == right.first() {
				Ok(CmpResult::Similar)
			} else {
				Ok(CmpResult::Mismatch)
			}
		}
	}

	fn group(dir: &TempDir) -> Group {
		let mut group = Group::new("test", dir.path());
		group.add_objtype("contact");
		group.add_member(
			MemberConfig::new(MemberId(1), "a").with_sink(SinkConfig::new("contact")),
		);
		group.add_member(
			MemberConfig::new(MemberId(2), "b").with_sink(SinkConfig::new("contact")),
		);
		group
	}

	fn change(uid: &str, payload: &[u8]) -> Change {
		let format: Arc<dyn crate::format::ObjectFormat> = Arc::new(LooseFormat);
		Change::new(uid, ChangeType::Added, Some(Data::new(payload.to_vec(), format))).unwrap()
	}

	#[tokio::test]
	async fn same_match_steals_a_similar_slot() {
		let dir = TempDir::new().unwrap();
		let group = group(&dir);
		let archive = Arc::new(Archive::open(&dir.path().join("archive.db")).await.unwrap());
		let ctx = ObjCtx {
			group: &group,
			registry: Arc::new(FormatRegistry::new()),
			archive,
			events: Arc::new(EventBus::default()),
		};

		let mut engine = ObjEngine::new("contact");
		engine.initialize(&ctx).await.unwrap();

		engine.receive_change(MemberId(1), change("a1", b"ab"), &ctx).unwrap();
		engine.receive_change(MemberId(2), change("b1", b"ax"), &ctx).unwrap();
		engine.receive_change(MemberId(2), change("b2", b"ab"), &ctx).unwrap();

		engine.map_changes(&ctx).unwrap();

		assert_eq!(engine.mappings.len(), 2);

		// The exact copy won the slot and cleared the conflict...
		let first = &engine.mappings[0];
		assert!(!first.has_conflict());
		assert_eq!(first.entry(0).change().unwrap().uid(), "a1");
		assert_eq!(first.entry(1).change().unwrap().uid(), "b2");

		// ...and the similar attachment moved out into its own mapping.
		let second = &engine.mappings[1];
		assert!(second.entry(0).change().is_none());
		assert_eq!(second.entry(1).change().unwrap().uid(), "b1");
	}

	#[tokio::test]
	async fn mismatching_changes_get_separate_mappings() {
		let dir = TempDir::new().unwrap();
		let group = group(&dir);
		let archive = Arc::new(Archive::open(&dir.path().join("archive.db")).await.unwrap());
		let ctx = ObjCtx {
			group: &group,
			registry: Arc::new(FormatRegistry::new()),
			archive,
			events: Arc::new(EventBus::default()),
		};

		let mut engine = ObjEngine::new("contact");
		engine.initialize(&ctx).await.unwrap();

		engine.receive_change(MemberId(1), change("a1", b"alpha"), &ctx).unwrap();
		engine.receive_change(MemberId(2), change("b1", b"zeta"), &ctx).unwrap();

		engine.map_changes(&ctx).unwrap();

		assert_eq!(engine.mappings.len(), 2);
		assert_eq!(engine.mappings[0].id().0 + 1, engine.mappings[1].id().0);
	}
}
