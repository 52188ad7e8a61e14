//! SQLite access for the archive and helper stores.

use crate::error::SyncResult;
use sqlx::sqlite::{
	SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use tracing::debug;

/// Thin wrapper around a single-file SQLite database.
///
/// The engine accesses every store from the driver task only, so the
/// pool is capped at one connection; WAL keeps writes cheap.
pub struct Database {
	pool: SqlitePool,
}

impl Database {
	/// Open a database file, creating it (and its parent directory) on
	/// first use.
	pub async fn open(path: &Path) -> SyncResult<Self> {
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)?;
			}
		}

		let options = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Normal);

		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect_with(options)
			.await?;

		debug!("opened database at {}", path.display());

		Ok(Self { pool })
	}

	pub async fn close(&self) {
		self.pool.close().await;
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	/// Run a statement that takes no bind parameters.
	pub async fn execute(&self, sql: &str) -> SyncResult<u64> {
		let result = sqlx::query(sql).execute(&self.pool).await?;
		Ok(result.rows_affected())
	}

	/// First column of the first row, if any row matches.
	pub async fn query_single_string(&self, sql: &str) -> SyncResult<Option<String>> {
		let value = sqlx::query_scalar(sql).fetch_optional(&self.pool).await?;
		Ok(value)
	}

	/// All rows of a query, every column rendered as text.
	pub async fn query_table(&self, sql: &str) -> SyncResult<Vec<Vec<Option<String>>>> {
		use sqlx::Row;

		let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
		let mut table = Vec::with_capacity(rows.len());
		for row in rows {
			let mut columns = Vec::with_capacity(row.columns().len());
			for index in 0..row.columns().len() {
				columns.push(row.try_get::<Option<String>, _>(index)?);
			}
			table.push(columns);
		}
		Ok(table)
	}

	pub async fn table_exists(&self, name: &str) -> SyncResult<bool> {
		let count: i64 =
			sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
				.bind(name)
				.fetch_one(&self.pool)
				.await?;
		Ok(count > 0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn creates_file_and_tables_on_the_fly() {
		let dir = TempDir::new().unwrap();
		let db = Database::open(&dir.path().join("nested/test.db")).await.unwrap();

		assert!(!db.table_exists("tbl_things").await.unwrap());
		db.execute("CREATE TABLE IF NOT EXISTS tbl_things (id INTEGER PRIMARY KEY, name VARCHAR)")
			.await
			.unwrap();
		assert!(db.table_exists("tbl_things").await.unwrap());

		db.execute("INSERT INTO tbl_things (name) VALUES ('one')")
			.await
			.unwrap();
		let name = db
			.query_single_string("SELECT name FROM tbl_things")
			.await
			.unwrap();
		assert_eq!(name.as_deref(), Some("one"));
	}

	#[tokio::test]
	async fn query_table_renders_rows_as_text() {
		let dir = TempDir::new().unwrap();
		let db = Database::open(&dir.path().join("test.db")).await.unwrap();

		db.execute("CREATE TABLE tbl_pairs (k VARCHAR, v VARCHAR)")
			.await
			.unwrap();
		db.execute("INSERT INTO tbl_pairs VALUES ('one', '1'), ('two', NULL)")
			.await
			.unwrap();

		let table = db
			.query_table("SELECT k, v FROM tbl_pairs ORDER BY k")
			.await
			.unwrap();
		assert_eq!(
			table,
			vec![
				vec![Some("one".to_owned()), Some("1".to_owned())],
				vec![Some("two".to_owned()), None],
			]
		);
	}
}
