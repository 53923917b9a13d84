//! Integration tests for the store: schema evolution, staging lifecycle,
//! fetch-state persistence and queue idempotency against a real SQLite file.

mod common;

use std::collections::BTreeSet;

use bifrost::store::{QueueFilter, StagingRow};

fn row(pairs: &[(&str, &str)]) -> StagingRow {
	pairs
		.iter()
		.map(|(k, v)| (k.to_string(), v.to_string()))
		.collect()
}

#[tokio::test]
async fn staging_table_evolves_with_new_columns() {
	let (store, _dir) = common::test_store().await;

	let first = vec![row(&[("composition_id", "c1"), ("code", "A")])];
	store.insert_staging_rows("condition", &first).await.unwrap();

	// a later fetch returns an extra column; the table grows, nothing breaks
	let second = vec![row(&[
		("composition_id", "c2"),
		("code", "B"),
		("severity", "mild"),
	])];
	store.insert_staging_rows("condition", &second).await.unwrap();

	let rows = store
		.read_unprocessed_rows("condition", "id", None)
		.await
		.unwrap();
	assert_eq!(rows.len(), 2);
	assert_eq!(rows[0].get("composition_id").unwrap(), "c1");
	// first row predates the column; it reads as empty
	assert_eq!(rows[0].get("severity").map(String::as_str), Some(""));
	assert_eq!(rows[1].get("severity").unwrap(), "mild");
	// ids come back as text in the dynamic map
	assert_eq!(rows[0].get("id").unwrap(), "1");
}

#[tokio::test]
async fn ensure_resource_table_is_idempotent() {
	let (store, _dir) = common::test_store().await;

	let cols: BTreeSet<String> =
		["composition_id".to_string(), "code".to_string()].into();
	store.ensure_resource_table("observation", &cols).await.unwrap();
	store.ensure_resource_table("observation", &cols).await.unwrap();

	let rows = store
		.read_unprocessed_rows("observation", "id", None)
		.await
		.unwrap();
	assert!(rows.is_empty());
}

#[tokio::test]
async fn fetch_state_upserts() {
	let (store, _dir) = common::test_store().await;

	assert_eq!(store.get_fetch_state("condition").await.unwrap(), None);

	store
		.update_fetch_state("condition", "2025-01-01T00:00:00", "2025-01-01T06:00:00")
		.await
		.unwrap();
	store
		.update_fetch_state("condition", "2025-01-01T06:00:00", "2025-01-01T12:00:00")
		.await
		.unwrap();

	let state = store.get_fetch_state("condition").await.unwrap().unwrap();
	assert_eq!(state.0, "2025-01-01T06:00:00");
	assert_eq!(state.1, "2025-01-01T12:00:00");
}

#[tokio::test]
async fn queue_insert_is_idempotent_per_identifier() {
	let (store, _dir) = common::test_store().await;

	// same staging id re-enqueued: no-op
	store
		.enqueue_standard(1, "Condition", "comp-1", "{}")
		.await
		.unwrap();
	store
		.enqueue_standard(1, "Condition", "comp-1", "{\"changed\":true}")
		.await
		.unwrap();
	// different staging row mapping to the same identifier: also a no-op
	store
		.enqueue_standard(2, "Condition", "comp-1", "{}")
		.await
		.unwrap();

	let rows = store.read_queue(QueueFilter::Standard, 10).await.unwrap();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].id, 1);
	assert_eq!(rows[0].identifier, "comp-1");
	assert_eq!(rows[0].resource_data, "{}");
}

#[tokio::test]
async fn consent_queue_keyed_by_group_value() {
	let (store, _dir) = common::test_store().await;

	store.enqueue_consent("Consent", "A", "{}").await.unwrap();
	store.enqueue_consent("Consent", "A", "{}").await.unwrap();
	store.enqueue_consent("Consent", "B", "{}").await.unwrap();

	let consent_rows = store.read_queue(QueueFilter::Consent, 10).await.unwrap();
	assert_eq!(consent_rows.len(), 2);

	// the standard filter must not see consent rows
	let standard = store.read_queue(QueueFilter::Standard, 10).await.unwrap();
	assert!(standard.is_empty());
}

#[tokio::test]
async fn mark_and_delete_standard_clears_queue_and_staging() {
	let (store, _dir) = common::test_store().await;

	store
		.insert_staging_rows("condition", &[row(&[("composition_id", "c1")])])
		.await
		.unwrap();
	store
		.enqueue_standard(1, "Condition", "c1", "{}")
		.await
		.unwrap();

	store.mark_and_delete_standard(1, "condition").await.unwrap();

	assert!(store.read_queue(QueueFilter::Standard, 10).await.unwrap().is_empty());
	assert!(store
		.read_unprocessed_rows("condition", "id", None)
		.await
		.unwrap()
		.is_empty());
}

#[tokio::test]
async fn consent_group_mark_and_delete() {
	let (store, _dir) = common::test_store().await;
	common::stage_consent_rows(&store, &[("A", "permit", "C1"), ("A", "permit", "C2"), ("B", "deny", "C3")])
		.await;

	store.mark_processed_by_group("consent", "composition_id", "A").await.unwrap();
	let unprocessed = store
		.read_unprocessed_rows("consent", "composition_id", None)
		.await
		.unwrap();
	assert_eq!(unprocessed.len(), 1);
	assert_eq!(unprocessed[0].get("composition_id").unwrap(), "B");

	store.enqueue_consent("Consent", "A", "{}").await.unwrap();
	let queue_id = store.read_queue(QueueFilter::Consent, 10).await.unwrap()[0].id;
	store
		.mark_and_delete_consent(queue_id, "consent", "composition_id", "A")
		.await
		.unwrap();

	// both A rows are gone, the processed flag notwithstanding
	let remaining = store
		.read_unprocessed_rows("consent", "composition_id", None)
		.await
		.unwrap();
	assert_eq!(remaining.len(), 1);
	assert!(store.read_queue(QueueFilter::Consent, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn batch_limit_is_respected() {
	let (store, _dir) = common::test_store().await;

	let rows: Vec<StagingRow> = (0..5)
		.map(|i| {
			let cid = format!("c{i}");
			row(&[("composition_id", cid.as_str())])
		})
		.collect();
	store.insert_staging_rows("condition", &rows).await.unwrap();

	let limited = store
		.read_unprocessed_rows("condition", "id", Some(2))
		.await
		.unwrap();
	assert_eq!(limited.len(), 2);
}
