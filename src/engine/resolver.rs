//! Hooks the embedding application plugs into a run.

use super::command::Resolution;
use crate::config::MemberId;
use crate::data::ChangeType;
use crate::mapping::MappingId;
use async_trait::async_trait;

/// Everything a resolver gets to see about one conflicting mapping
#[derive(Debug, Clone)]
pub struct ConflictView {
	pub objtype: String,
	pub mapping: MappingId,
	pub entries: Vec<ConflictEntry>,
}

#[derive(Debug, Clone)]
pub struct ConflictEntry {
	pub member: MemberId,
	pub uid: Option<String>,
	pub change_type: ChangeType,
	pub payload: Option<Vec<u8>>,
}

/// What the resolver wants done with a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
	Resolve(Resolution),
	/// Leave the conflict pending; the application resolves it later
	/// through [`Engine::solve_mapping`](crate::engine::Engine::solve_mapping).
	Defer,
	/// Give up on the whole run
	Abort,
}

/// Decides conflicting mappings during the resolution phase.
///
/// Called once per conflicting mapping, from the engine driver; a slow
/// resolver stalls the run, a deferring one lets it continue later.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
	async fn resolve(&self, conflict: &ConflictView) -> ConflictDecision;
}

/// Always picks the same resolution. Useful as a policy default and in
/// tests.
pub struct FixedResolver(pub Resolution);

#[async_trait]
impl ConflictResolver for FixedResolver {
	async fn resolve(&self, _conflict: &ConflictView) -> ConflictDecision {
		ConflictDecision::Resolve(self.0)
	}
}

/// Dirty-entry counts of one member after multiplication
#[derive(Debug, Clone, Default)]
pub struct MemberSummary {
	pub member: MemberId,
	pub added: u32,
	pub modified: u32,
	pub deleted: u32,
	pub unmodified: u32,
	pub unknown: u32,
}

#[derive(Debug, Clone)]
pub struct ObjTypeSummary {
	pub objtype: String,
	pub members: Vec<MemberSummary>,
}

/// What multiplication produced, before anything is written
#[derive(Debug, Clone, Default)]
pub struct MultiplySummary {
	pub objtypes: Vec<ObjTypeSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplyDecision {
	Proceed,
	Abort,
}

/// Reviews the multiplication outcome before the write phase starts.
///
/// The hook is the last veto point: returning `Abort` ends the run
/// through the error path with every peer still seeing a disconnect.
#[async_trait]
pub trait MultiplyHook: Send + Sync {
	async fn multiplied(&self, summary: &MultiplySummary) -> MultiplyDecision;
}
