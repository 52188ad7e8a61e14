//! The peer adapter boundary.
//!
//! A [`PeerProxy`] is the engine's view of one peer: every phase of a
//! run becomes one call here. Calls are async and independent; the
//! engine issues them concurrently across peers and correlates the
//! results itself, so implementations never see engine internals.
//!
//! During `get_changes` a peer streams records through the
//! [`ChangeSink`] it was handed; the stream ends when the call returns.

use crate::config::SinkConfig;
use crate::data::Change;
use crate::error::SyncResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Hands reported changes back to the engine during `get_changes`.
#[derive(Clone)]
pub struct ChangeSink {
	tx: mpsc::UnboundedSender<Change>,
}

impl ChangeSink {
	pub fn new() -> (Self, mpsc::UnboundedReceiver<Change>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	/// Report one change. Reports after the engine stopped listening
	/// are dropped.
	pub fn send(&self, change: Change) {
		let _ = self.tx.send(change);
	}
}

/// One peer's side of the synchronization protocol.
///
/// `objtype` is `Some(..)` for an object-type sink and `None` for the
/// peer's main sink, which spans all types.
#[async_trait]
pub trait PeerProxy: Send + Sync {
	/// Open the peer. Returns true when the peer itself requests a
	/// slow sync (e.g. because its resumption anchor mismatched).
	async fn connect(&self, objtype: Option<&str>, slow_sync: bool) -> SyncResult<bool>;

	/// All peers are connected; last setup step before reading.
	async fn connect_done(&self, objtype: Option<&str>) -> SyncResult<()> {
		let _ = objtype;
		Ok(())
	}

	/// Stream every change since the last run (or everything, on slow
	/// sync) into `sink`, then return.
	async fn get_changes(
		&self,
		objtype: Option<&str>,
		slow_sync: bool,
		sink: ChangeSink,
	) -> SyncResult<()>;

	/// Re-read one record, identified by the change's uid, with its
	/// current payload.
	async fn read(&self, change: Change) -> SyncResult<Change>;

	/// Apply one change to the peer's store. May return a replacement
	/// uid when the peer assigns its own identifiers.
	async fn commit_change(&self, change: Change) -> SyncResult<Option<String>>;

	/// All commits for this sink were issued.
	async fn committed_all(&self, objtype: Option<&str>) -> SyncResult<()> {
		let _ = objtype;
		Ok(())
	}

	/// The run reached sync-done; persist resumption state now.
	async fn sync_done(&self, objtype: Option<&str>) -> SyncResult<()> {
		let _ = objtype;
		Ok(())
	}

	/// Terminal call of every run, errors included.
	async fn disconnect(&self, objtype: Option<&str>) -> SyncResult<()>;

	/// One-shot capability discovery, outside any sync run.
	async fn discover(&self) -> SyncResult<Vec<SinkConfig>>;

	/// Final teardown when the engine is finalized.
	async fn finalize(&self) -> SyncResult<()> {
		Ok(())
	}

	/// Stop whatever transport carries this proxy. Called once after
	/// `finalize`; in-process adapters usually have nothing to do.
	async fn shutdown(&self) -> SyncResult<()> {
		Ok(())
	}
}
