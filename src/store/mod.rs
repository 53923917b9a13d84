//! Pooled database access for the pipeline's durable state: per-resource
//! staging tables, the `fetch_state` table and the `fhir_queue`.
//!
//! Works against PostgreSQL or SQLite through sqlx's `Any` driver; the few
//! dialect differences (autoincrement keys, upsert spelling) are branched on
//! [`DbKind`]. All DDL is idempotent, and staging tables evolve by adding
//! missing text columns — columns are never dropped.

pub mod normalize;

use std::collections::BTreeSet;

use log::{debug, warn};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row};
use thiserror::Error;

pub use normalize::StagingRow;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("invalid identifier '{0}'")]
	InvalidIdentifier(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
	Postgres,
	Sqlite,
}

/// One pending upsert against the FHIR server.
#[derive(Debug, Clone)]
pub struct QueueRow {
	pub id: i64,
	pub resource_type: String,
	pub identifier: String,
	pub resource_data: String,
}

/// Which queue rows to drain: Consent is published by its own stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFilter {
	Standard,
	Consent,
}

#[derive(Clone)]
pub struct Store {
	pool: AnyPool,
	kind: DbKind,
}

impl Store {
	/// Connect a bounded pool. Connections are health-checked before reuse so
	/// a stale connection is replaced instead of handed to a caller.
	pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
		sqlx::any::install_default_drivers();

		let kind = if url.starts_with("sqlite") {
			DbKind::Sqlite
		} else {
			DbKind::Postgres
		};

		let pool = AnyPoolOptions::new()
			.min_connections(1)
			.max_connections(max_connections)
			.test_before_acquire(true)
			.connect(url)
			.await?;

		Ok(Self { pool, kind })
	}

	pub fn kind(&self) -> DbKind {
		self.kind
	}

	pub async fn ping(&self) -> Result<(), StoreError> {
		sqlx::query("SELECT 1").execute(&self.pool).await?;
		Ok(())
	}

	pub async fn close(&self) {
		self.pool.close().await;
	}

	// ------------------------------------------------------------------
	// Schema
	// ------------------------------------------------------------------

	pub async fn ensure_fetch_state_table(&self) -> Result<(), StoreError> {
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS fetch_state (
				resource TEXT PRIMARY KEY,
				last_run_time TEXT NOT NULL,
				next_run_time TEXT NOT NULL
			)",
		)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn ensure_fhir_queue_table(&self) -> Result<(), StoreError> {
		let ddl = match self.kind {
			DbKind::Postgres => {
				"CREATE TABLE IF NOT EXISTS fhir_queue (
					id SERIAL PRIMARY KEY,
					resource_type TEXT NOT NULL,
					identifier TEXT NOT NULL UNIQUE,
					resource_data TEXT NOT NULL,
					processed BOOLEAN DEFAULT FALSE
				)"
			}
			DbKind::Sqlite => {
				"CREATE TABLE IF NOT EXISTS fhir_queue (
					id INTEGER PRIMARY KEY AUTOINCREMENT,
					resource_type TEXT NOT NULL,
					identifier TEXT NOT NULL UNIQUE,
					resource_data TEXT NOT NULL,
					processed BOOLEAN DEFAULT FALSE
				)"
			}
		};
		sqlx::query(ddl).execute(&self.pool).await?;
		Ok(())
	}

	/// Create the staging table for `name` if absent, then add any missing
	/// text columns. Existing columns are left alone.
	pub async fn ensure_resource_table(
		&self,
		name: &str,
		columns: &BTreeSet<String>,
	) -> Result<(), StoreError> {
		let table = table_ident(name)?;

		let mut defs: Vec<String> = columns
			.iter()
			.map(|c| format!("{} TEXT", column_ident(c)))
			.collect();
		defs.push("processed BOOLEAN DEFAULT FALSE".to_string());

		let ddl = match self.kind {
			DbKind::Postgres => format!(
				"CREATE TABLE IF NOT EXISTS {table} (id SERIAL PRIMARY KEY, {})",
				defs.join(", ")
			),
			DbKind::Sqlite => format!(
				"CREATE TABLE IF NOT EXISTS {table} (id INTEGER PRIMARY KEY AUTOINCREMENT, {})",
				defs.join(", ")
			),
		};
		sqlx::query(&ddl).execute(&self.pool).await?;

		let existing = self.existing_columns(&table).await?;
		for column in columns {
			let ident = column_ident(column);
			if existing.contains(ident.trim_matches('"')) {
				continue;
			}
			let alter = format!("ALTER TABLE {table} ADD COLUMN {ident} TEXT");
			if let Err(e) = sqlx::query(&alter).execute(&self.pool).await {
				warn!("could not add column {ident} to {table}: {e}");
			} else {
				debug!("added column {ident} to staging table {table}");
			}
		}

		Ok(())
	}

	async fn existing_columns(&self, table: &str) -> Result<BTreeSet<String>, StoreError> {
		let bare = table.trim_matches('"');
		let rows: Vec<AnyRow> = match self.kind {
			DbKind::Postgres => {
				sqlx::query(
					"SELECT column_name::text AS name FROM information_schema.columns
					 WHERE table_name = $1",
				)
				.bind(bare)
				.fetch_all(&self.pool)
				.await?
			}
			DbKind::Sqlite => {
				sqlx::query("SELECT name FROM pragma_table_info($1)")
					.bind(bare)
					.fetch_all(&self.pool)
					.await?
			}
		};

		Ok(rows
			.iter()
			.filter_map(|r| r.try_get::<String, _>("name").ok())
			.collect())
	}

	// ------------------------------------------------------------------
	// Staging rows
	// ------------------------------------------------------------------

	/// Bulk-insert normalised rows into the resource's staging table. The
	/// table is evolved first so every key has a column.
	pub async fn insert_staging_rows(
		&self,
		name: &str,
		rows: &[StagingRow],
	) -> Result<u64, StoreError> {
		if rows.is_empty() {
			return Ok(0);
		}

		let all_columns: BTreeSet<String> =
			rows.iter().flat_map(|r| r.keys().cloned()).collect();
		self.ensure_resource_table(name, &all_columns).await?;

		let table = table_ident(name)?;
		let mut inserted = 0u64;
		let mut conn = self.pool.acquire().await?;

		for row in rows {
			let columns: Vec<&String> = row.keys().collect();
			let idents: Vec<String> = columns.iter().map(|c| column_ident(c)).collect();
			let placeholders: Vec<String> =
				(1..=columns.len()).map(|i| format!("${i}")).collect();

			let sql = format!(
				"INSERT INTO {table} ({}) VALUES ({})",
				idents.join(", "),
				placeholders.join(", ")
			);

			let mut query = sqlx::query(&sql);
			for column in &columns {
				query = query.bind(row.get(*column).map(String::as_str).unwrap_or(""));
			}
			query.execute(&mut *conn).await?;
			inserted += 1;
		}

		Ok(inserted)
	}

	/// Unprocessed staging rows as column→text maps, ordered by `order_by`
	/// (`id` for standard resources, the group column for Consent).
	pub async fn read_unprocessed_rows(
		&self,
		name: &str,
		order_by: &str,
		limit: Option<i64>,
	) -> Result<Vec<StagingRow>, StoreError> {
		let table = table_ident(name)?;
		let order = column_ident(order_by);

		let rows: Vec<AnyRow> = if let Some(limit) = limit {
			let sql = format!(
				"SELECT * FROM {table} WHERE processed = FALSE ORDER BY {order} LIMIT $1"
			);
			sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?
		} else {
			let sql =
				format!("SELECT * FROM {table} WHERE processed = FALSE ORDER BY {order}");
			sqlx::query(&sql).fetch_all(&self.pool).await?
		};

		Ok(rows.iter().map(row_to_map).collect())
	}

	/// Flag every Consent staging row of one group as enqueued.
	pub async fn mark_processed_by_group(
		&self,
		name: &str,
		group_column: &str,
		group_value: &str,
	) -> Result<u64, StoreError> {
		let table = table_ident(name)?;
		let column = column_ident(group_column);
		let sql = format!("UPDATE {table} SET processed = TRUE WHERE {column} = $1");
		let result = sqlx::query(&sql).bind(group_value).execute(&self.pool).await?;
		Ok(result.rows_affected())
	}

	// ------------------------------------------------------------------
	// fetch_state
	// ------------------------------------------------------------------

	pub async fn get_fetch_state(
		&self,
		resource: &str,
	) -> Result<Option<(String, String)>, StoreError> {
		let row = sqlx::query(
			"SELECT last_run_time, next_run_time FROM fetch_state WHERE resource = $1",
		)
		.bind(resource)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row.map(|r| {
			(
				r.try_get::<String, _>("last_run_time").unwrap_or_default(),
				r.try_get::<String, _>("next_run_time").unwrap_or_default(),
			)
		}))
	}

	pub async fn update_fetch_state(
		&self,
		resource: &str,
		last_run: &str,
		next_run: &str,
	) -> Result<(), StoreError> {
		let sql = match self.kind {
			DbKind::Postgres => {
				"INSERT INTO fetch_state (resource, last_run_time, next_run_time)
				 VALUES ($1, $2, $3)
				 ON CONFLICT (resource) DO UPDATE
				 SET last_run_time = EXCLUDED.last_run_time,
				     next_run_time = EXCLUDED.next_run_time"
			}
			DbKind::Sqlite => {
				"INSERT OR REPLACE INTO fetch_state (resource, last_run_time, next_run_time)
				 VALUES ($1, $2, $3)"
			}
		};
		sqlx::query(sql)
			.bind(resource)
			.bind(last_run)
			.bind(next_run)
			.execute(&self.pool)
			.await?;
		debug!("fetch state for {resource}: {last_run} -> {next_run}");
		Ok(())
	}

	// ------------------------------------------------------------------
	// fhir_queue
	// ------------------------------------------------------------------

	/// Enqueue a standard resource keyed by its staging row id. Conflicts
	/// (same id or same identifier) are ignored: the existing row wins.
	pub async fn enqueue_standard(
		&self,
		staging_id: i64,
		resource_type: &str,
		identifier: &str,
		resource_data: &str,
	) -> Result<(), StoreError> {
		let sql = match self.kind {
			DbKind::Postgres => {
				"INSERT INTO fhir_queue (id, resource_type, identifier, resource_data, processed)
				 VALUES ($1, $2, $3, $4, FALSE)
				 ON CONFLICT DO NOTHING"
			}
			DbKind::Sqlite => {
				"INSERT OR IGNORE INTO fhir_queue (id, resource_type, identifier, resource_data, processed)
				 VALUES ($1, $2, $3, $4, FALSE)"
			}
		};
		sqlx::query(sql)
			.bind(staging_id)
			.bind(resource_type)
			.bind(identifier)
			.bind(resource_data)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Enqueue a grouped Consent resource keyed by its group value.
	pub async fn enqueue_consent(
		&self,
		resource_type: &str,
		identifier: &str,
		resource_data: &str,
	) -> Result<(), StoreError> {
		let sql = match self.kind {
			DbKind::Postgres => {
				"INSERT INTO fhir_queue (resource_type, identifier, resource_data, processed)
				 VALUES ($1, $2, $3, FALSE)
				 ON CONFLICT (identifier) DO NOTHING"
			}
			DbKind::Sqlite => {
				"INSERT OR IGNORE INTO fhir_queue (resource_type, identifier, resource_data, processed)
				 VALUES ($1, $2, $3, FALSE)"
			}
		};
		sqlx::query(sql)
			.bind(resource_type)
			.bind(identifier)
			.bind(resource_data)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn read_queue(
		&self,
		filter: QueueFilter,
		limit: i64,
	) -> Result<Vec<QueueRow>, StoreError> {
		let sql = match filter {
			QueueFilter::Standard => {
				"SELECT CAST(id AS BIGINT) AS id, resource_type, identifier, resource_data
				 FROM fhir_queue
				 WHERE processed = FALSE AND LOWER(resource_type) <> 'consent'
				 ORDER BY id LIMIT $1"
			}
			QueueFilter::Consent => {
				"SELECT CAST(id AS BIGINT) AS id, resource_type, identifier, resource_data
				 FROM fhir_queue
				 WHERE processed = FALSE AND LOWER(resource_type) = 'consent'
				 ORDER BY id LIMIT $1"
			}
		};

		let rows = sqlx::query(sql).bind(limit).fetch_all(&self.pool).await?;
		Ok(rows
			.iter()
			.map(|r| QueueRow {
				id: r.try_get("id").unwrap_or_default(),
				resource_type: r.try_get("resource_type").unwrap_or_default(),
				identifier: r.try_get("identifier").unwrap_or_default(),
				resource_data: r.try_get("resource_data").unwrap_or_default(),
			})
			.collect())
	}

	/// Successful publish of a standard resource: mark the queue row, delete
	/// it, delete the originating staging row. Runs on one connection so the
	/// sequence is not interleaved with other pool users.
	pub async fn mark_and_delete_standard(
		&self,
		queue_id: i64,
		staging_table: &str,
	) -> Result<(), StoreError> {
		let table = table_ident(staging_table)?;
		let mut conn = self.pool.acquire().await?;

		sqlx::query("UPDATE fhir_queue SET processed = TRUE WHERE id = $1")
			.bind(queue_id)
			.execute(&mut *conn)
			.await?;
		sqlx::query("DELETE FROM fhir_queue WHERE id = $1")
			.bind(queue_id)
			.execute(&mut *conn)
			.await?;

		let sql = format!("DELETE FROM {table} WHERE id = $1");
		sqlx::query(&sql).bind(queue_id).execute(&mut *conn).await?;
		Ok(())
	}

	/// Successful publish of a Consent: mark and delete the queue row, then
	/// delete every staging row of the group.
	pub async fn mark_and_delete_consent(
		&self,
		queue_id: i64,
		staging_table: &str,
		group_column: &str,
		group_value: &str,
	) -> Result<(), StoreError> {
		let table = table_ident(staging_table)?;
		let column = column_ident(group_column);
		let mut conn = self.pool.acquire().await?;

		sqlx::query("UPDATE fhir_queue SET processed = TRUE WHERE id = $1")
			.bind(queue_id)
			.execute(&mut *conn)
			.await?;
		sqlx::query("DELETE FROM fhir_queue WHERE id = $1")
			.bind(queue_id)
			.execute(&mut *conn)
			.await?;

		let sql = format!("DELETE FROM {table} WHERE {column} = $1");
		sqlx::query(&sql).bind(group_value).execute(&mut *conn).await?;
		Ok(())
	}
}

/// Validate and quote a staging table name. Resource names are lowercased and
/// must already be `[a-z0-9_]+` not starting with a digit; anything else is
/// rejected rather than repaired.
fn table_ident(name: &str) -> Result<String, StoreError> {
	let lowered = name.to_lowercase();
	let valid = !lowered.is_empty()
		&& !lowered.chars().next().is_some_and(|c| c.is_ascii_digit())
		&& lowered
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '_');
	if !valid {
		return Err(StoreError::InvalidIdentifier(name.to_string()));
	}
	Ok(format!("\"{lowered}\""))
}

/// Lowercase and quote a column name; anything outside `[a-z0-9_]` is
/// replaced so dynamic AQL aliases cannot break out of the identifier.
fn column_ident(name: &str) -> String {
	let mut cleaned: String = name
		.to_lowercase()
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '_' {
				c
			} else {
				'_'
			}
		})
		.collect();
	if cleaned.is_empty() {
		cleaned.push_str("col");
	}
	if cleaned.chars().next().is_some_and(|c| c.is_ascii_digit()) {
		cleaned.insert(0, '_');
	}
	format!("\"{cleaned}\"")
}

/// Decode a dynamic row into a column→text map. Staging columns are TEXT,
/// but `id` (and anything a backend reports as numeric) is rendered through
/// the typed fallbacks.
fn row_to_map(row: &AnyRow) -> StagingRow {
	let mut map = StagingRow::new();
	for (idx, column) in row.columns().iter().enumerate() {
		let name = column.name().to_lowercase();
		if name == "processed" {
			continue;
		}
		if let Some(text) = any_value_to_string(row, idx) {
			map.insert(name, text);
		} else {
			map.insert(name, String::new());
		}
	}
	map
}

fn any_value_to_string(row: &AnyRow, idx: usize) -> Option<String> {
	if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
		return v;
	}
	if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
		return v.map(|n| n.to_string());
	}
	if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
		return v.map(|n| n.to_string());
	}
	if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
		return v.map(|n| n.to_string());
	}
	if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
		return v.map(|b| b.to_string());
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn table_ident_rejects_garbage() {
		assert_eq!(table_ident("Condition").unwrap(), "\"condition\"");
		assert_eq!(table_ident("fhir_queue").unwrap(), "\"fhir_queue\"");
		assert!(table_ident("; DROP TABLE x --").is_err());
		assert!(table_ident("").is_err());
		assert!(table_ident("1abc").is_err());
	}

	#[test]
	fn column_ident_normalises() {
		assert_eq!(column_ident("Composition_ID"), "\"composition_id\"");
		assert_eq!(column_ident("weird name"), "\"weird_name\"");
		assert_eq!(column_ident("1col"), "\"_1col\"");
		assert_eq!(column_ident(""), "\"col\"");
	}
}
