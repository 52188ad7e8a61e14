//! Unclean-shutdown recovery and user aborts.

mod helpers;

use converge::archive::Archive;
use converge::config::Group;
use converge::engine::{Engine, EngineOptions};
use converge::infrastructure::events::{EngineEvent, SyncEvent};
use helpers::MemoryPeer;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

#[tokio::test]
async fn stale_lock_forces_a_slow_sync() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let a = MemoryPeer::new("peer-a", "contact", helpers::plain_format(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", helpers::plain_format(), dir.path()).await;
	a.insert("a1", b"Alice");

	// A clean first run.
	{
		let group = Group::load_or_create("test-group", dir.path()).unwrap();
		let engine = Engine::initialize(
			group,
			helpers::proxies(&a, &b),
			helpers::plain_registry(),
			EngineOptions::default(),
		)
		.await
		.unwrap();
		engine.synchronize_and_block().await.unwrap();
		engine.finalize().await.unwrap();
	}

	// The very first run is always slow; remember the baseline.
	let slow_before = (a.count_calls("slow_sync"), b.count_calls("slow_sync"));

	// Simulate a crashed process: a lock file owned by a dead pid.
	std::fs::write(dir.path().join("lock"), "0").unwrap();

	let group = Group::load_or_create("test-group", dir.path()).unwrap();
	let engine = Engine::initialize(
		group,
		helpers::proxies(&a, &b),
		helpers::plain_registry(),
		EngineOptions::default(),
	)
	.await
	.unwrap();
	let mut rx = engine.subscribe();
	engine.synchronize_and_block().await.unwrap();
	engine.finalize().await.unwrap();

	let mut saw_prev_unclean = false;
	while let Ok(event) = rx.try_recv() {
		if let SyncEvent::Engine {
			event: EngineEvent::PrevUnclean,
			..
		} = event
		{
			saw_prev_unclean = true;
		}
	}
	assert!(saw_prev_unclean, "the unclean previous run is reported");

	// Every peer ran its object type as a slow sync again.
	assert_eq!(a.count_calls("slow_sync"), slow_before.0 + 1);
	assert_eq!(b.count_calls("slow_sync"), slow_before.1 + 1);

	// The identity survives: still one mapping with an entry per peer,
	// and the record exists exactly once on each side.
	let archive = Archive::open(&dir.path().join("archive.db")).await.unwrap();
	let rows = archive.load_changes("contact").await.unwrap();
	assert_eq!(rows.len(), 2);
	assert_eq!(rows[0].mapping, rows[1].mapping);
	assert_eq!(a.records().len(), 1);
	assert_eq!(b.records().len(), 1);
}

#[tokio::test]
async fn abort_mid_run_still_disconnects_every_peer() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let a = MemoryPeer::new("peer-a", "contact", helpers::plain_format(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", helpers::plain_format(), dir.path()).await;
	a.insert("a1", b"Alice");

	// Park both peers inside get-changes so the abort lands between
	// the read and write phases.
	let (gate_tx, gate_rx) = watch::channel(false);
	a.set_gate(gate_rx.clone());
	b.set_gate(gate_rx);

	let group = Group::load_or_create("test-group", dir.path()).unwrap();
	let engine = Engine::initialize(
		group,
		helpers::proxies(&a, &b),
		helpers::plain_registry(),
		EngineOptions::default(),
	)
	.await
	.unwrap();
	let mut rx = engine.subscribe();

	let runner = engine.clone();
	let run = tokio::spawn(async move { runner.synchronize_and_block().await });

	// Wait until both peers are being read.
	for _ in 0..200 {
		if a.count_calls("get_changes:contact") >= 1 && b.count_calls("get_changes:contact") >= 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert_eq!(a.count_calls("get_changes:contact"), 1);

	engine.abort().unwrap();
	gate_tx.send(true).unwrap();

	let err = run.await.unwrap().unwrap_err();
	assert!(
		err.message().contains("aborted"),
		"unexpected error: {}",
		err.print_stack()
	);

	// Peers saw exactly one terminal disconnect each, and nothing was
	// written.
	for peer in [&a, &b] {
		assert_eq!(peer.count_calls("disconnect:contact"), 1);
		assert_eq!(peer.count_calls("disconnect:main"), 1);
		assert_eq!(peer.count_calls("commit:"), 0);
	}
	assert!(b.records().is_empty());

	let mut saw_successful = false;
	let mut saw_error = 0;
	while let Ok(event) = rx.try_recv() {
		match event {
			SyncEvent::Engine {
				event: EngineEvent::Successful,
				..
			} => saw_successful = true,
			SyncEvent::Engine {
				event: EngineEvent::Error,
				..
			} => saw_error += 1,
			_ => {}
		}
	}
	assert!(!saw_successful, "an aborted run is not successful");
	assert_eq!(saw_error, 1, "the error is reported exactly once");

	// The sticky error blocks further runs until repaired.
	let blocked = engine.synchronize().unwrap_err();
	assert_eq!(blocked.kind(), converge::ErrorKind::Initialization);
	engine.repair().unwrap();
	engine.synchronize_and_block().await.unwrap();

	engine.finalize().await.unwrap();
}

#[tokio::test]
async fn peer_requested_slow_sync_covers_every_objtype() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let a = MemoryPeer::new("peer-a", "contact", helpers::plain_format(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", helpers::plain_format(), dir.path()).await;
	a.insert("a1", b"Alice");

	// Clean first run.
	{
		let group = Group::load_or_create("test-group", dir.path()).unwrap();
		let engine = Engine::initialize(
			group,
			helpers::proxies(&a, &b),
			helpers::plain_registry(),
			EngineOptions::default(),
		)
		.await
		.unwrap();
		engine.synchronize_and_block().await.unwrap();
		engine.finalize().await.unwrap();
	}

	let slow_before = (a.count_calls("slow_sync"), b.count_calls("slow_sync"));

	// Peer A's anchor mismatched: it asks for a slow sync during
	// connect, which spreads to every peer.
	a.request_slow_sync();

	let group = Group::load_or_create("test-group", dir.path()).unwrap();
	let engine = Engine::initialize(
		group,
		helpers::proxies(&a, &b),
		helpers::plain_registry(),
		EngineOptions::default(),
	)
	.await
	.unwrap();
	engine.synchronize_and_block().await.unwrap();
	engine.finalize().await.unwrap();

	assert_eq!(a.count_calls("slow_sync"), slow_before.0 + 1);
	assert_eq!(b.count_calls("slow_sync"), slow_before.1 + 1);
	assert_eq!(a.records().len(), 1);
	assert_eq!(b.records().len(), 1);
}

#[tokio::test]
async fn discovery_reports_the_peer_sinks() {
	let dir = TempDir::new().unwrap();
	helpers::two_peer_group(dir.path());

	let a = MemoryPeer::new("peer-a", "contact", helpers::plain_format(), dir.path()).await;
	let b = MemoryPeer::new("peer-b", "contact", helpers::plain_format(), dir.path()).await;

	let group = Group::load_or_create("test-group", dir.path()).unwrap();
	let engine = Engine::initialize(
		group,
		helpers::proxies(&a, &b),
		helpers::plain_registry(),
		EngineOptions::default(),
	)
	.await
	.unwrap();

	let sinks = engine.discover(converge::MemberId(2)).await.unwrap();
	assert_eq!(sinks.len(), 1);
	assert_eq!(sinks[0].objtype, "contact");
	assert_eq!(b.count_calls("discover"), 1);

	engine.finalize().await.unwrap();
}
