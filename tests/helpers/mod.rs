#![allow(dead_code)]
//! Shared fixtures: an in-memory peer adapter plus group and format
//! setups used across the integration tests.

use async_trait::async_trait;
use converge::config::{Group, MemberConfig, MemberId, SinkConfig};
use converge::data::{Change, ChangeType, Data};
use converge::error::{SyncError, SyncResult};
use converge::format::{
	Capabilities, CmpResult, Duplicated, FormatRegistry, ObjectFormat, PlainFormat,
};
use converge::helper::HashTable;
use converge::proxy::{ChangeSink, PeerProxy};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Content hash the test peers use for change detection.
pub fn hash_of(payload: &[u8]) -> String {
	payload.iter().map(|b| format!("{b:02x}")).collect()
}

/// A peer adapter over an in-memory record store, with a real
/// [`HashTable`] for change detection.
pub struct MemoryPeer {
	name: String,
	objtype: String,
	format: Arc<dyn ObjectFormat>,
	store: Mutex<BTreeMap<String, Vec<u8>>>,
	hashtable: tokio::sync::Mutex<HashTable>,
	calls: Mutex<Vec<String>>,
	/// When set, object-type get-changes calls block until the gate
	/// opens. Lets tests park the engine inside the read phase.
	gate: Mutex<Option<watch::Receiver<bool>>>,
	/// Ask for a slow sync on the next connect, like an adapter whose
	/// resumption anchor mismatched.
	request_slow_sync: AtomicBool,
}

impl MemoryPeer {
	pub async fn new(
		name: &str,
		objtype: &str,
		format: Arc<dyn ObjectFormat>,
		dir: &Path,
	) -> Arc<Self> {
		let hashtable = HashTable::load(&dir.join(format!("{name}-hash.db")), objtype)
			.await
			.expect("hashtable opens");
		Arc::new(Self {
			name: name.to_owned(),
			objtype: objtype.to_owned(),
			format,
			store: Mutex::new(BTreeMap::new()),
			hashtable: tokio::sync::Mutex::new(hashtable),
			calls: Mutex::new(Vec::new()),
			gate: Mutex::new(None),
			request_slow_sync: AtomicBool::new(false),
		})
	}

	pub fn request_slow_sync(&self) {
		self.request_slow_sync.store(true, Ordering::SeqCst);
	}

	pub fn insert(&self, uid: &str, payload: &[u8]) {
		self.store.lock().unwrap().insert(uid.to_owned(), payload.to_vec());
	}

	pub fn remove(&self, uid: &str) {
		self.store.lock().unwrap().remove(uid);
	}

	pub fn records(&self) -> BTreeMap<String, Vec<u8>> {
		self.store.lock().unwrap().clone()
	}

	pub fn values(&self) -> Vec<Vec<u8>> {
		self.records().into_values().collect()
	}

	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().unwrap().clone()
	}

	pub fn count_calls(&self, prefix: &str) -> usize {
		self.calls
			.lock()
			.unwrap()
			.iter()
			.filter(|c| c.starts_with(prefix))
			.count()
	}

	pub fn set_gate(&self, gate: watch::Receiver<bool>) {
		*self.gate.lock().unwrap() = Some(gate);
	}

	fn log(&self, call: impl Into<String>) {
		self.calls.lock().unwrap().push(call.into());
	}

	fn target(objtype: Option<&str>) -> &str {
		objtype.unwrap_or("main")
	}
}

#[async_trait]
impl PeerProxy for MemoryPeer {
	async fn connect(&self, objtype: Option<&str>, _slow_sync: bool) -> SyncResult<bool> {
		self.log(format!("connect:{}", Self::target(objtype)));
		Ok(self.request_slow_sync.swap(false, Ordering::SeqCst))
	}

	async fn connect_done(&self, objtype: Option<&str>) -> SyncResult<()> {
		self.log(format!("connect_done:{}", Self::target(objtype)));
		Ok(())
	}

	async fn get_changes(
		&self,
		objtype: Option<&str>,
		slow_sync: bool,
		sink: ChangeSink,
	) -> SyncResult<()> {
		self.log(format!("get_changes:{}", Self::target(objtype)));

		let Some(objtype) = objtype else {
			return Ok(());
		};
		if objtype != self.objtype {
			return Ok(());
		}

		let gate = self.gate.lock().unwrap().clone();
		if let Some(mut gate) = gate {
			let _ = gate.wait_for(|open| *open).await;
		}

		let mut table = self.hashtable.lock().await;
		if slow_sync {
			self.log("slow_sync");
			table.slow_sync();
		}

		let records = self.store.lock().unwrap().clone();
		for (uid, payload) in records {
			let mut change = Change::new(
				uid,
				ChangeType::Unknown,
				Some(Data::new(payload.clone(), self.format.clone())),
			)?
			.with_hash(hash_of(&payload));

			let change_type = table.change_type(&change);
			change.set_change_type(change_type);
			table.update_change(&change);

			if change_type != ChangeType::Unmodified {
				sink.send(change);
			}
		}

		for uid in table.deleted() {
			let change =
				Change::new(uid, ChangeType::Deleted, None)?.with_objtype(self.objtype.clone());
			table.update_change(&change);
			sink.send(change);
		}

		Ok(())
	}

	async fn read(&self, mut change: Change) -> SyncResult<Change> {
		self.log(format!("read:{}", change.uid()));
		let payload = self.store.lock().unwrap().get(change.uid()).cloned();
		match payload {
			Some(payload) => {
				change.set_hash(hash_of(&payload));
				change.set_data(Some(Data::new(payload, self.format.clone())));
				Ok(change)
			}
			None => Err(SyncError::generic(format!(
				"{} has no record {}",
				self.name,
				change.uid()
			))),
		}
	}

	async fn commit_change(&self, change: Change) -> SyncResult<Option<String>> {
		self.log(format!("commit:{}:{}", change.change_type(), change.uid()));

		match change.change_type() {
			ChangeType::Deleted => {
				self.store.lock().unwrap().remove(change.uid());
			}
			_ => {
				let payload = change
					.data()
					.ok_or_else(|| SyncError::generic("commit without payload"))?
					.bytes()
					.to_vec();
				self.store
					.lock()
					.unwrap()
					.insert(change.uid().to_owned(), payload);
			}
		}

		// Keep the hash table current so the next run does not report
		// engine-written records as local changes.
		let mut tracked = change.clone();
		if let Some(data) = tracked.data() {
			let hash = hash_of(data.bytes());
			tracked.set_hash(hash);
		}
		self.hashtable.lock().await.update_change(&tracked);

		Ok(None)
	}

	async fn committed_all(&self, objtype: Option<&str>) -> SyncResult<()> {
		self.log(format!("committed_all:{}", Self::target(objtype)));
		Ok(())
	}

	async fn sync_done(&self, objtype: Option<&str>) -> SyncResult<()> {
		self.log(format!("sync_done:{}", Self::target(objtype)));
		self.hashtable.lock().await.save().await
	}

	async fn disconnect(&self, objtype: Option<&str>) -> SyncResult<()> {
		self.log(format!("disconnect:{}", Self::target(objtype)));
		Ok(())
	}

	async fn discover(&self) -> SyncResult<Vec<SinkConfig>> {
		self.log("discover");
		Ok(vec![SinkConfig::new(self.objtype.clone())])
	}

	async fn finalize(&self) -> SyncResult<()> {
		self.log("finalize");
		Ok(())
	}
}

/// Byte-identity format whose revision is the payload length, so
/// "longer is newer" in use-latest tests.
pub struct LengthRevisionFormat;

impl ObjectFormat for LengthRevisionFormat {
	fn name(&self) -> &str {
		"plain"
	}

	fn objtype(&self) -> &str {
		"contact"
	}

	fn compare(&self, left: &[u8], right: &[u8]) -> SyncResult<CmpResult> {
		Ok(if left == right {
			CmpResult::Same
		} else {
			CmpResult::Mismatch
		})
	}

	fn duplicate(&self, uid: &str, data: &[u8]) -> SyncResult<Duplicated> {
		Ok(Duplicated {
			uid: format!("{uid}-dupe"),
			bytes: data.to_vec(),
			dirty: true,
		})
	}

	fn revision(&self, data: &[u8]) -> SyncResult<i64> {
		Ok(data.len() as i64)
	}
}

/// Line-oriented `key:value` format with a merger: peers only keep the
/// keys their capabilities name, the archive keeps the rest.
pub struct FieldFormat;

impl FieldFormat {
	fn lines(data: &[u8]) -> Vec<(String, String)> {
		String::from_utf8_lossy(data)
			.lines()
			.filter_map(|line| {
				line.split_once(':')
					.map(|(k, v)| (k.to_owned(), v.to_owned()))
			})
			.collect()
	}

	fn join(mut lines: Vec<(String, String)>) -> Vec<u8> {
		lines.sort();
		lines
			.into_iter()
			.map(|(k, v)| format!("{k}:{v}"))
			.collect::<Vec<_>>()
			.join("\n")
			.into_bytes()
	}
}

impl ObjectFormat for FieldFormat {
	fn name(&self) -> &str {
		"fields"
	}

	fn objtype(&self) -> &str {
		"contact"
	}

	fn compare(&self, left: &[u8], right: &[u8]) -> SyncResult<CmpResult> {
		Ok(if left == right {
			CmpResult::Same
		} else {
			CmpResult::Mismatch
		})
	}

	fn has_merger(&self) -> bool {
		true
	}

	fn demerge(&self, input: &[u8], caps: &Capabilities) -> SyncResult<Vec<u8>> {
		let kept = Self::lines(input)
			.into_iter()
			.filter(|(key, _)| caps.supports(key))
			.collect();
		Ok(Self::join(kept))
	}

	fn merge(&self, input: &[u8], entire: &[u8], caps: &Capabilities) -> SyncResult<Vec<u8>> {
		let mut merged = Self::lines(input);
		for (key, value) in Self::lines(entire) {
			if !caps.supports(&key) {
				merged.push((key, value));
			}
		}
		Ok(Self::join(merged))
	}
}

pub fn plain_format() -> Arc<dyn ObjectFormat> {
	PlainFormat::for_objtype("contact")
}

pub fn plain_registry() -> Arc<FormatRegistry> {
	let mut registry = FormatRegistry::new();
	registry.register_format(plain_format());
	Arc::new(registry)
}

/// A two-peer contact group rooted at `dir`, written to disk so later
/// runs can reload it with the recorded last-sync timestamp.
pub fn two_peer_group(dir: &Path) -> Group {
	let mut group = Group::new("test-group", dir);
	group.add_objtype("contact");
	group.add_member(MemberConfig::new(MemberId(1), "peer-a").with_sink(SinkConfig::new("contact")));
	group.add_member(MemberConfig::new(MemberId(2), "peer-b").with_sink(SinkConfig::new("contact")));
	group.save().expect("group saves");
	group
}

pub fn proxies(a: &Arc<MemoryPeer>, b: &Arc<MemoryPeer>) -> Vec<Arc<dyn PeerProxy>> {
	vec![a.clone() as Arc<dyn PeerProxy>, b.clone() as Arc<dyn PeerProxy>]
}
