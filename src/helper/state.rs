//! Small per-peer resumption state.
//!
//! Peer adapters keep tiny `(objtype, key) → value` facts here, such as
//! the server token of the last completed sync. Comparing the stored
//! value against the device's current one during connect tells the
//! adapter whether to request a slow sync.

use crate::error::SyncResult;
use crate::infrastructure::database::Database;
use std::path::Path;

pub struct SinkStateDb {
	db: Database,
	/// None scopes keys to the peer's main sink
	objtype: Option<String>,
}

impl SinkStateDb {
	pub async fn open(path: &Path, objtype: Option<&str>) -> SyncResult<Self> {
		let db = Database::open(path).await?;
		db.execute(
			"CREATE TABLE IF NOT EXISTS tbl_sink_states (\
			 objtype VARCHAR NOT NULL, \
			 key VARCHAR NOT NULL, \
			 value VARCHAR, \
			 PRIMARY KEY (objtype, key))",
		)
		.await?;

		Ok(Self {
			db,
			objtype: objtype.map(str::to_owned),
		})
	}

	fn scope(&self) -> &str {
		self.objtype.as_deref().unwrap_or("")
	}

	/// Stored value for a key; missing keys read as the empty string.
	pub async fn get(&self, key: &str) -> SyncResult<String> {
		let value: Option<String> =
			sqlx::query_scalar("SELECT value FROM tbl_sink_states WHERE objtype = ? AND key = ?")
				.bind(self.scope())
				.bind(key)
				.fetch_optional(self.db.pool())
				.await?;
		Ok(value.unwrap_or_default())
	}

	pub async fn set(&self, key: &str, value: &str) -> SyncResult<()> {
		sqlx::query("REPLACE INTO tbl_sink_states (objtype, key, value) VALUES (?, ?, ?)")
			.bind(self.scope())
			.bind(key)
			.bind(value)
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	/// Read and compare in one step.
	pub async fn equal(&self, key: &str, value: &str) -> SyncResult<bool> {
		Ok(self.get(key).await? == value)
	}
}
