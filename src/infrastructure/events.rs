//! Status events for the embedding application.
//!
//! The engine reports progress through a broadcast bus: group-level
//! phase transitions, per-member and per-change events, and mapping
//! resolutions. Emitting without subscribers is fine.

use crate::config::MemberId;
use crate::error::SyncError;
use crate::mapping::MappingId;
use std::fmt;
use tokio::sync::broadcast;

/// Group-level engine transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
	Connected,
	ConnectDone,
	Read,
	PreparedMap,
	Mapped,
	EndConflicts,
	Multiplied,
	PreparedWrite,
	Written,
	SyncDone,
	Disconnected,
	Error,
	Successful,
	PrevUnclean,
}

impl fmt::Display for EngineEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Connected => "CONNECTED",
			Self::ConnectDone => "CONNECT_DONE",
			Self::Read => "READ",
			Self::PreparedMap => "PREPARED_MAP",
			Self::Mapped => "MAPPED",
			Self::EndConflicts => "END_CONFLICTS",
			Self::Multiplied => "MULTIPLIED",
			Self::PreparedWrite => "PREPARED_WRITE",
			Self::Written => "WRITTEN",
			Self::SyncDone => "SYNC_DONE",
			Self::Disconnected => "DISCONNECTED",
			Self::Error => "ERROR",
			Self::Successful => "SUCCESSFUL",
			Self::PrevUnclean => "PREV_UNCLEAN",
		};
		write!(f, "{name}")
	}
}

/// Per-member, per-phase events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEvent {
	Connected,
	ConnectDone,
	Read,
	Written,
	SyncDone,
	Disconnected,
	Discovered,
	Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
	Read,
	Written,
	Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingEvent {
	Solved,
	Error,
}

/// Everything the engine reports to the embedder
#[derive(Debug, Clone)]
pub enum SyncEvent {
	Engine {
		event: EngineEvent,
		error: Option<SyncError>,
	},
	Member {
		member: MemberId,
		objtype: Option<String>,
		event: MemberEvent,
		error: Option<SyncError>,
	},
	Change {
		member: MemberId,
		objtype: String,
		uid: String,
		mapping: Option<MappingId>,
		event: ChangeEvent,
		error: Option<SyncError>,
	},
	Mapping {
		objtype: String,
		mapping: MappingId,
		event: MappingEvent,
		error: Option<SyncError>,
	},
}

/// Broadcast bus for [`SyncEvent`]s
pub struct EventBus {
	sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Emit an event; missing receivers are not an error.
	pub fn emit(&self, event: SyncEvent) {
		let _ = self.sender.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1024)
	}
}
