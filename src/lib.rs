//! Multi-peer record synchronization engine.
//!
//! A group of two or more peers each hold a mutable collection of
//! records (contacts, events, tasks, ...). One synchronization run
//! reconciles them: every peer connects, reports its changes, changes
//! are matched into cross-peer mappings, conflicts are resolved, the
//! winners are multiplied into per-peer updates and written back, and
//! every peer disconnects. Afterwards all peers hold the same logical
//! set of records.
//!
//! Peers are integrated by implementing [`proxy::PeerProxy`]; record
//! layouts by implementing [`format::ObjectFormat`]. The [`engine`]
//! module drives a configured [`config::Group`] through runs and
//! reports progress on a broadcast event bus.

pub mod archive;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod format;
pub mod helper;
pub mod infrastructure;
pub mod mapping;
pub mod proxy;

pub use config::{Group, MemberConfig, MemberId, SinkConfig};
pub use data::{Change, ChangeType, Data};
pub use engine::{
	ConflictDecision, ConflictResolver, ConflictView, Engine, EngineOptions, Resolution,
};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use format::{FormatRegistry, ObjectFormat, PlainFormat};
pub use infrastructure::events::{EngineEvent, SyncEvent};
pub use mapping::MappingId;
pub use proxy::{ChangeSink, PeerProxy};
