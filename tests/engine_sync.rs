//! End-to-end synchronization runs over in-memory peers.

mod helpers;

use converge::archive::Archive;
use converge::config::{Group, MemberId};
use converge::engine::{Engine, EngineOptions, FixedResolver, Resolution};
use converge::infrastructure::events::{EngineEvent, SyncEvent};
use helpers::MemoryPeer;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

/// Run one full synchronization over the group stored in `dir`,
/// returning the run result and every event the engine reported.
async fn sync_once(
	dir: &TempDir,
	a: &Arc<MemoryPeer>,
	b: &Arc<MemoryPeer>,
	options: EngineOptions,
) -> (converge::SyncResult<()>, Vec<SyncEvent>) {
	let group = Group::load_or_create("test-group", dir.path()).unwrap();
	let engine = Engine::initialize(group, helpers::proxies(a, b), helpers::plain_registry(), options)
		.await
		.unwrap();

	let mut rx = engine.subscribe();
	let result = engine.synchronize_and_block().await;
	engine.finalize().await.unwrap();

	let mut events = Vec::new();
	while let Ok(event) = rx.try_recv() {
		events.push(event);
	}
	(result, events)
}

fn engine_statuses(events: &[SyncEvent]) -> Vec<EngineEvent> {
	events
		.iter()
		.filter_map(|e| match e {
			SyncEvent::Engine { event, .. } => Some(*event),
			_ => None,
		})
		.collect()
}

#[tokio::test]
async fn one_add_propagates_to_the_other_peer() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let a = MemoryPeer::new("peer-a", "contact", helpers::plain_format(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", helpers::plain_format(), dir.path()).await;
	a.insert("a1", b"Alice");

	let (result, events) = sync_once(&dir, &a, &b, EngineOptions::default()).await;
	result.unwrap();

	assert_eq!(b.values(), vec![b"Alice".to_vec()]);
	assert_eq!(b.count_calls("commit:added"), 1);

	// Both entries of the single mapping are archived with real uids.
	let archive = Archive::open(&dir.path().join("archive.db")).await.unwrap();
	let rows = archive.load_changes("contact").await.unwrap();
	assert_eq!(rows.len(), 2);
	assert_eq!(rows[0].mapping, rows[1].mapping);
	assert!(rows.iter().all(|r| !r.uid.is_empty()));

	let statuses = engine_statuses(&events);
	for expected in [
		EngineEvent::Connected,
		EngineEvent::ConnectDone,
		EngineEvent::Read,
		EngineEvent::Mapped,
		EngineEvent::Multiplied,
		EngineEvent::Written,
		EngineEvent::SyncDone,
		EngineEvent::Successful,
		EngineEvent::Disconnected,
	] {
		assert_eq!(
			statuses.iter().filter(|s| **s == expected).count(),
			1,
			"{expected} should be reported exactly once"
		);
	}
	let successful = statuses.iter().position(|s| *s == EngineEvent::Successful);
	let disconnected = statuses.iter().position(|s| *s == EngineEvent::Disconnected);
	assert!(successful < disconnected, "successful is reported before disconnected");
	assert!(!statuses.contains(&EngineEvent::Error));
}

#[tokio::test]
async fn second_run_is_quiet_when_nothing_changed() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let a = MemoryPeer::new("peer-a", "contact", helpers::plain_format(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", helpers::plain_format(), dir.path()).await;
	a.insert("a1", b"Alice");

	sync_once(&dir, &a, &b, EngineOptions::default()).await.0.unwrap();
	let commits_before = a.count_calls("commit:") + b.count_calls("commit:");

	sync_once(&dir, &a, &b, EngineOptions::default()).await.0.unwrap();
	let commits_after = a.count_calls("commit:") + b.count_calls("commit:");

	assert_eq!(commits_before, commits_after, "a quiet run commits nothing");
}

#[tokio::test]
async fn deletion_propagates() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let a = MemoryPeer::new("peer-a", "contact", helpers::plain_format(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", helpers::plain_format(), dir.path()).await;
	a.insert("a1", b"Alice");

	sync_once(&dir, &a, &b, EngineOptions::default()).await.0.unwrap();
	assert_eq!(b.records().len(), 1);

	a.remove("a1");
	sync_once(&dir, &a, &b, EngineOptions::default()).await.0.unwrap();

	assert!(a.records().is_empty());
	assert!(b.records().is_empty());
	assert_eq!(b.count_calls("commit:deleted"), 1);

	// The mapping is gone from the archive as well.
	let archive = Archive::open(&dir.path().join("archive.db")).await.unwrap();
	assert!(archive.load_changes("contact").await.unwrap().is_empty());
}

#[tokio::test]
async fn symmetric_modification_resolved_by_choose() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let a = MemoryPeer::new("peer-a", "contact", helpers::plain_format(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", helpers::plain_format(), dir.path()).await;
	a.insert("a1", b"Alice");

	sync_once(&dir, &a, &b, EngineOptions::default()).await.0.unwrap();

	// Both sides edit the same record in different ways.
	let (a_uid, _) = a.records().into_iter().next().unwrap();
	let (b_uid, _) = b.records().into_iter().next().unwrap();
	a.insert(&a_uid, b"Alice A");
	b.insert(&b_uid, b"Alice B");

	let options = EngineOptions {
		resolver: Some(Arc::new(FixedResolver(Resolution::Choose {
			member: MemberId(1),
		}))),
		..EngineOptions::default()
	};
	sync_once(&dir, &a, &b, options).await.0.unwrap();

	assert_eq!(a.values(), vec![b"Alice A".to_vec()]);
	assert_eq!(b.values(), vec![b"Alice A".to_vec()]);
	assert_eq!(b.count_calls("commit:modified"), 1);
	assert_eq!(a.count_calls("commit:modified"), 0, "the winner is not rewritten");
}

#[tokio::test]
async fn use_latest_picks_the_newer_revision() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let format: Arc<dyn converge::ObjectFormat> = Arc::new(helpers::LengthRevisionFormat);
	let a = MemoryPeer::new("peer-a", "contact", format.clone(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", format.clone(), dir.path()).await;
	a.insert("a1", b"Alice");

	sync_once(&dir, &a, &b, EngineOptions::default()).await.0.unwrap();

	let (a_uid, _) = a.records().into_iter().next().unwrap();
	let (b_uid, _) = b.records().into_iter().next().unwrap();
	// The revision of this format is the payload length: peer B holds
	// the newer version.
	a.insert(&a_uid, b"Alice A");
	b.insert(&b_uid, b"Alice Bee");

	let options = EngineOptions {
		resolver: Some(Arc::new(FixedResolver(Resolution::UseLatest))),
		..EngineOptions::default()
	};
	sync_once(&dir, &a, &b, options).await.0.unwrap();

	assert_eq!(a.values(), vec![b"Alice Bee".to_vec()]);
	assert_eq!(b.values(), vec![b"Alice Bee".to_vec()]);
}

#[tokio::test]
async fn conflict_without_resolver_fails_the_run() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let a = MemoryPeer::new("peer-a", "contact", helpers::plain_format(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", helpers::plain_format(), dir.path()).await;
	a.insert("a1", b"Alice");

	sync_once(&dir, &a, &b, EngineOptions::default()).await.0.unwrap();

	let (a_uid, _) = a.records().into_iter().next().unwrap();
	let (b_uid, _) = b.records().into_iter().next().unwrap();
	a.insert(&a_uid, b"Alice A");
	b.insert(&b_uid, b"Alice B");

	let (result, events) = sync_once(&dir, &a, &b, EngineOptions::default()).await;
	let err = result.unwrap_err();
	assert_eq!(err.kind(), converge::ErrorKind::Generic);

	// Peers still saw a clean disconnect.
	assert_eq!(a.count_calls("disconnect:contact"), 2);
	assert!(!engine_statuses(&events).contains(&EngineEvent::Successful));
}
