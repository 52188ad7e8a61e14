//! Commands processed by the engine driver.

use crate::config::{MemberId, SinkConfig};
use crate::error::SyncResult;
use crate::mapping::MappingId;
use std::fmt;
use tokio::sync::oneshot;

/// How a conflicting mapping gets resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
	/// That member's version wins
	Choose { member: MemberId },
	/// Keep every version, each under a fresh uid in its own mapping
	Duplicate,
	/// Leave the records untouched and revisit next run
	Ignore,
	/// The version with the highest format revision wins
	UseLatest,
}

impl fmt::Display for Resolution {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Choose { member } => write!(f, "choose({member})"),
			Self::Duplicate => write!(f, "duplicate"),
			Self::Ignore => write!(f, "ignore"),
			Self::UseLatest => write!(f, "use-latest"),
		}
	}
}

/// One unit of work for the driver task
pub(crate) enum EngineCommand {
	Connect,
	EndConflicts,
	Multiply,
	Solve {
		objtype: String,
		mapping: MappingId,
		resolution: Resolution,
	},
	Discover {
		member: MemberId,
		reply: oneshot::Sender<SyncResult<Vec<SinkConfig>>>,
	},
	Abort,
}

impl fmt::Display for EngineCommand {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Connect => "CONNECT",
			Self::EndConflicts => "END_CONFLICTS",
			Self::Multiply => "MULTIPLY",
			Self::Solve { .. } => "SOLVE",
			Self::Discover { .. } => "DISCOVER",
			Self::Abort => "ABORT",
		};
		write!(f, "{name}")
	}
}
