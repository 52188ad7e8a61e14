//! Change detection for peer adapters.
//!
//! Many backends only report current state. A hash table remembers the
//! (uid → hash) pairs of the previous run; feeding every live record
//! through it yields added/modified/unmodified classifications, and
//! whatever was never reported this run is deleted.

use crate::data::{Change, ChangeType};
use crate::error::SyncResult;
use crate::infrastructure::database::Database;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

pub struct HashTable {
	db: Database,
	objtype: String,
	/// Baseline loaded from disk, mutated as records are reported
	entries: HashMap<String, String>,
	/// Uids reported this run, whatever their change type
	reported: HashSet<String>,
}

impl HashTable {
	/// Open or create the backing table and load the baseline.
	pub async fn load(path: &Path, objtype: &str) -> SyncResult<Self> {
		let db = Database::open(path).await?;
		db.execute(
			"CREATE TABLE IF NOT EXISTS tbl_hashes (\
			 uid TEXT PRIMARY KEY, hash TEXT NOT NULL)",
		)
		.await?;

		let rows = sqlx::query("SELECT uid, hash FROM tbl_hashes")
			.fetch_all(db.pool())
			.await?;
		let mut entries = HashMap::with_capacity(rows.len());
		for row in rows {
			entries.insert(row.try_get::<String, _>(0)?, row.try_get::<String, _>(1)?);
		}

		debug!("loaded {} hash entries for {objtype}", entries.len());

		Ok(Self {
			db,
			objtype: objtype.to_owned(),
			entries,
			reported: HashSet::new(),
		})
	}

	pub fn objtype(&self) -> &str {
		&self.objtype
	}

	/// Classify a record against the baseline by its uid and hash.
	pub fn change_type(&self, change: &Change) -> ChangeType {
		match self.entries.get(change.uid()) {
			None => ChangeType::Added,
			Some(known) if Some(known.as_str()) == change.hash() => ChangeType::Unmodified,
			Some(_) => ChangeType::Modified,
		}
	}

	/// Record a report. Must be called for every live record, even
	/// unmodified ones, or the record shows up as deleted later.
	pub fn update_change(&mut self, change: &Change) {
		self.reported.insert(change.uid().to_owned());

		if change.change_type() == ChangeType::Deleted {
			self.entries.remove(change.uid());
		} else if let Some(hash) = change.hash() {
			self.entries.insert(change.uid().to_owned(), hash.to_owned());
		}
	}

	/// Baseline uids that were never reported this run.
	pub fn deleted(&self) -> Vec<String> {
		self.entries
			.keys()
			.filter(|uid| !self.reported.contains(*uid))
			.cloned()
			.collect()
	}

	/// Wipe the baseline so the next pass reports everything as added.
	pub fn slow_sync(&mut self) {
		self.entries.clear();
		self.reported.clear();
	}

	pub fn hash_of(&self, uid: &str) -> Option<&str> {
		self.entries.get(uid).map(String::as_str)
	}

	pub fn num_entries(&self) -> usize {
		self.entries.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// Persist the in-memory state, dropping entries removed since
	/// load. Called once at sync-done.
	pub async fn save(&mut self) -> SyncResult<()> {
		let mut tx = self.db.pool().begin().await?;
		sqlx::query("DELETE FROM tbl_hashes").execute(&mut *tx).await?;
		for (uid, hash) in &self.entries {
			sqlx::query("INSERT INTO tbl_hashes (uid, hash) VALUES (?, ?)")
				.bind(uid)
				.bind(hash)
				.execute(&mut *tx)
				.await?;
		}
		tx.commit().await?;

		self.reported.clear();
		debug!("saved {} hash entries for {}", self.entries.len(), self.objtype);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::Data;
	use crate::format::PlainFormat;
	use tempfile::TempDir;

	fn change(uid: &str, hash: &str, change_type: ChangeType) -> Change {
		let data = Data::new(b"payload".to_vec(), PlainFormat::for_objtype("contact"));
		Change::new(uid, change_type, Some(data))
			.unwrap()
			.with_hash(hash)
	}

	#[tokio::test]
	async fn classifies_against_the_baseline() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hash.db");

		let mut table = HashTable::load(&path, "contact").await.unwrap();
		let a1 = change("a1", "h1", ChangeType::Unknown);
		assert_eq!(table.change_type(&a1), ChangeType::Added);

		table.update_change(&a1);
		table.save().await.unwrap();
		drop(table);

		let table = HashTable::load(&path, "contact").await.unwrap();
		assert_eq!(table.change_type(&change("a1", "h1", ChangeType::Unknown)), ChangeType::Unmodified);
		assert_eq!(table.change_type(&change("a1", "h2", ChangeType::Unknown)), ChangeType::Modified);
		assert_eq!(table.change_type(&change("a2", "h1", ChangeType::Unknown)), ChangeType::Added);
	}

	#[tokio::test]
	async fn unreported_baseline_uids_are_deleted() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hash.db");

		let mut table = HashTable::load(&path, "contact").await.unwrap();
		table.update_change(&change("a1", "h1", ChangeType::Added));
		table.update_change(&change("a2", "h2", ChangeType::Added));
		table.save().await.unwrap();
		drop(table);

		let mut table = HashTable::load(&path, "contact").await.unwrap();
		table.update_change(&change("a1", "h1", ChangeType::Unmodified));

		assert_eq!(table.deleted(), vec!["a2".to_owned()]);
	}

	#[tokio::test]
	async fn slow_sync_wipes_the_baseline() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hash.db");

		let mut table = HashTable::load(&path, "contact").await.unwrap();
		table.update_change(&change("a1", "h1", ChangeType::Added));
		table.save().await.unwrap();

		table.slow_sync();
		assert_eq!(table.num_entries(), 0);
		assert_eq!(table.change_type(&change("a1", "h1", ChangeType::Unknown)), ChangeType::Added);

		table.save().await.unwrap();
		drop(table);

		let table = HashTable::load(&path, "contact").await.unwrap();
		assert_eq!(table.num_entries(), 0);
	}
}
