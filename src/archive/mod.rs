//! Durable per-group store.
//!
//! Three tables back a group across runs: `tbl_changes` holds one row
//! per (objtype, mapping, member) linking peer-local uids into mappings,
//! `tbl_archive` keeps an optional payload snapshot per mapping for the
//! merger, and `tbl_changelog` records conflicts the user chose to
//! ignore so the next run re-injects them.

use crate::config::MemberId;
use crate::data::ChangeType;
use crate::error::SyncResult;
use crate::infrastructure::database::Database;
use crate::mapping::MappingId;
use sqlx::Row;
use std::path::Path;
use tracing::{debug, trace};

/// One row of `tbl_changes`
#[derive(Debug, Clone)]
pub struct ChangeRow {
	pub id: i64,
	pub uid: String,
	pub mapping: MappingId,
	pub member: MemberId,
}

/// One row of `tbl_changelog`
#[derive(Debug, Clone)]
pub struct IgnoredConflict {
	pub member: MemberId,
	pub mapping: MappingId,
	pub change_type: ChangeType,
}

pub struct Archive {
	db: Database,
}

impl Archive {
	pub async fn open(path: &Path) -> SyncResult<Self> {
		let db = Database::open(path).await?;

		db.execute(
			"CREATE TABLE IF NOT EXISTS tbl_changes (\
			 objtype VARCHAR(64) NOT NULL, \
			 id INTEGER PRIMARY KEY AUTOINCREMENT, \
			 uid VARCHAR NOT NULL, \
			 memberid INTEGER NOT NULL, \
			 mappingid INTEGER NOT NULL, \
			 objengine VARCHAR(64) NOT NULL)",
		)
		.await?;
		db.execute(
			"CREATE TABLE IF NOT EXISTS tbl_archive (\
			 objtype VARCHAR(64), \
			 mappingid INTEGER, \
			 data BLOB, \
			 PRIMARY KEY (objtype, mappingid))",
		)
		.await?;
		db.execute(
			"CREATE TABLE IF NOT EXISTS tbl_changelog (\
			 objtype VARCHAR(64) NOT NULL, \
			 memberid INTEGER NOT NULL, \
			 mappingid INTEGER NOT NULL, \
			 changetype INTEGER NOT NULL, \
			 PRIMARY KEY (objtype, memberid, mappingid))",
		)
		.await?;

		Ok(Self { db })
	}

	pub async fn close(&self) {
		self.db.close().await;
	}

	/// Insert (`id == 0`) or update one change row. Returns the row id.
	pub async fn save_change(
		&self,
		id: i64,
		uid: &str,
		objtype: &str,
		mapping: MappingId,
		member: MemberId,
		objengine: &str,
	) -> SyncResult<i64> {
		trace!("saving change {uid} for {objtype} mapping {mapping} member {member}");
		if id == 0 {
			let result = sqlx::query(
				"INSERT INTO tbl_changes (objtype, uid, mappingid, memberid, objengine) \
				 VALUES (?, ?, ?, ?, ?)",
			)
			.bind(objtype)
			.bind(uid)
			.bind(mapping.0)
			.bind(member.0)
			.bind(objengine)
			.execute(self.db.pool())
			.await?;
			Ok(result.last_insert_rowid())
		} else {
			sqlx::query(
				"UPDATE tbl_changes SET uid = ?, mappingid = ?, memberid = ?, objengine = ? \
				 WHERE objtype = ? AND id = ?",
			)
			.bind(uid)
			.bind(mapping.0)
			.bind(member.0)
			.bind(objengine)
			.bind(objtype)
			.bind(id)
			.execute(self.db.pool())
			.await?;
			Ok(id)
		}
	}

	pub async fn delete_change(&self, id: i64, objtype: &str) -> SyncResult<()> {
		sqlx::query("DELETE FROM tbl_changes WHERE objtype = ? AND id = ?")
			.bind(objtype)
			.bind(id)
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	/// Every change row of an object type, ordered by mapping id.
	pub async fn load_changes(&self, objtype: &str) -> SyncResult<Vec<ChangeRow>> {
		let rows = sqlx::query(
			"SELECT id, uid, mappingid, memberid FROM tbl_changes \
			 WHERE objtype = ? ORDER BY mappingid",
		)
		.bind(objtype)
		.fetch_all(self.db.pool())
		.await?;

		let mut changes = Vec::with_capacity(rows.len());
		for row in rows {
			changes.push(ChangeRow {
				id: row.try_get::<i64, _>(0)?,
				uid: row.try_get::<String, _>(1)?,
				mapping: MappingId(row.try_get::<i64, _>(2)?),
				member: MemberId(row.try_get::<i64, _>(3)? as u32),
			});
		}

		debug!("loaded {} change rows for {objtype}", changes.len());
		Ok(changes)
	}

	pub async fn flush_changes(&self, objtype: &str) -> SyncResult<()> {
		sqlx::query("DELETE FROM tbl_changes WHERE objtype = ?")
			.bind(objtype)
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	/// Rename a peer-local uid in place, e.g. after a peer reassigned
	/// the id during commit.
	pub async fn update_change_uid(
		&self,
		old_uid: &str,
		new_uid: &str,
		member: MemberId,
		objengine: &str,
	) -> SyncResult<()> {
		sqlx::query(
			"UPDATE tbl_changes SET uid = ? WHERE objengine = ? AND memberid = ? AND uid = ?",
		)
		.bind(new_uid)
		.bind(objengine)
		.bind(member.0)
		.bind(old_uid)
		.execute(self.db.pool())
		.await?;
		Ok(())
	}

	/// Store the full payload snapshot of a mapping, replacing any
	/// previous snapshot.
	pub async fn save_data(
		&self,
		mapping: MappingId,
		objtype: &str,
		data: &[u8],
	) -> SyncResult<()> {
		sqlx::query("REPLACE INTO tbl_archive (objtype, mappingid, data) VALUES (?, ?, ?)")
			.bind(objtype)
			.bind(mapping.0)
			.bind(data)
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	/// Snapshot for the mapping a uid belongs to, if one was stored.
	pub async fn load_data(&self, uid: &str, objtype: &str) -> SyncResult<Option<Vec<u8>>> {
		let row = sqlx::query(
			"SELECT data FROM tbl_archive WHERE objtype = ? AND mappingid = \
			 (SELECT mappingid FROM tbl_changes WHERE objtype = ? AND uid = ? LIMIT 1)",
		)
		.bind(objtype)
		.bind(objtype)
		.bind(uid)
		.fetch_optional(self.db.pool())
		.await?;

		match row {
			Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>(0)?)),
			None => Ok(None),
		}
	}

	pub async fn delete_data(&self, mapping: MappingId, objtype: &str) -> SyncResult<()> {
		sqlx::query("DELETE FROM tbl_archive WHERE objtype = ? AND mappingid = ?")
			.bind(objtype)
			.bind(mapping.0)
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	pub async fn save_ignored_conflict(
		&self,
		objtype: &str,
		member: MemberId,
		mapping: MappingId,
		change_type: ChangeType,
	) -> SyncResult<()> {
		sqlx::query(
			"REPLACE INTO tbl_changelog (objtype, memberid, mappingid, changetype) \
			 VALUES (?, ?, ?, ?)",
		)
		.bind(objtype)
		.bind(member.0)
		.bind(mapping.0)
		.bind(change_type.as_db())
		.execute(self.db.pool())
		.await?;
		Ok(())
	}

	pub async fn load_ignored_conflicts(&self, objtype: &str) -> SyncResult<Vec<IgnoredConflict>> {
		let rows = sqlx::query(
			"SELECT memberid, mappingid, changetype FROM tbl_changelog \
			 WHERE objtype = ? ORDER BY mappingid",
		)
		.bind(objtype)
		.fetch_all(self.db.pool())
		.await?;

		let mut ignored = Vec::with_capacity(rows.len());
		for row in rows {
			ignored.push(IgnoredConflict {
				member: MemberId(row.try_get::<i64, _>(0)? as u32),
				mapping: MappingId(row.try_get::<i64, _>(1)?),
				change_type: ChangeType::from_db(row.try_get::<i64, _>(2)?),
			});
		}
		Ok(ignored)
	}

	pub async fn flush_ignored_conflicts(&self, objtype: &str) -> SyncResult<()> {
		sqlx::query("DELETE FROM tbl_changelog WHERE objtype = ?")
			.bind(objtype)
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	/// Other object engines that share at least one mapping with the
	/// given one. Mappings span engines when records re-home across
	/// object types.
	pub async fn mixed_engines(&self, objengine: &str) -> SyncResult<Vec<String>> {
		let rows = sqlx::query(
			"SELECT DISTINCT b.objengine FROM tbl_changes AS a, tbl_changes AS b \
			 WHERE a.mappingid = b.mappingid AND a.objengine = ? AND b.objengine != ?",
		)
		.bind(objengine)
		.bind(objengine)
		.fetch_all(self.db.pool())
		.await?;

		let mut engines = Vec::with_capacity(rows.len());
		for row in rows {
			engines.push(row.try_get::<String, _>(0)?);
		}
		Ok(engines)
	}
}
