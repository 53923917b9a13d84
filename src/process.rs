//! Transformer/enqueuer stage: read unprocessed staging rows, render them
//! into FHIR resources and enqueue the results for publishing. Standard
//! resources map one row to one queue entry keyed by the staging id; Consent
//! rows are grouped first and keyed by the group value.

use anyhow::Result;
use log::{debug, info, warn};

use crate::config::{ResourceDefinition, Settings};
use crate::mapper;
use crate::mapper::consent;
use crate::store::Store;

pub struct Processor {
	store: Store,
	settings: Settings,
}

impl Processor {
	pub fn new(store: Store, settings: Settings) -> Self {
		Self { store, settings }
	}

	fn batch_limit(&self) -> Option<i64> {
		if self.settings.processing.use_batch {
			Some(self.settings.processing.batch_size)
		} else {
			None
		}
	}

	/// Transform and enqueue every non-Consent resource. Returns the number
	/// of rows enqueued. Per-row failures are logged and skipped; they never
	/// stop the batch.
	pub async fn process_standard(&self, resources: &[ResourceDefinition]) -> Result<u64> {
		self.store.ensure_fhir_queue_table().await?;

		let mut enqueued = 0u64;
		for def in resources.iter().filter(|d| !d.is_consent()) {
			if !def.mapping.is_object() {
				warn!("no mappings defined for '{}'; skipping", def.name);
				continue;
			}

			let rows = match self
				.store
				.read_unprocessed_rows(&def.name, "id", self.batch_limit())
				.await
			{
				Ok(rows) => rows,
				Err(e) => {
					warn!("cannot read staging rows for '{}': {e}", def.name);
					continue;
				}
			};
			if rows.is_empty() {
				debug!("no unprocessed rows in '{}'", def.name);
				continue;
			}
			info!("processing {} rows for '{}'", rows.len(), def.name);

			for row in &rows {
				let row_id = row.get("id").and_then(|v| v.parse::<i64>().ok());
				let Some(row_id) = row_id else {
					warn!("staging row in '{}' without numeric id; skipping", def.name);
					continue;
				};

				let resource =
					match mapper::map_resource(row, &def.mapping, &def.required_fields) {
						Ok(r) => r,
						Err(e) => {
							warn!("mapping error for '{}' row {row_id}: {e}", def.name);
							continue;
						}
					};
				if mapper::is_empty_resource(&resource) {
					warn!("mapping produced nothing for '{}' row {row_id}; skipping", def.name);
					continue;
				}

				let mut resource = resource;
				if resource.get("resourceType").is_none() {
					if let Some(obj) = resource.as_object_mut() {
						obj.insert(
							"resourceType".to_string(),
							serde_json::Value::String(def.fhir_type.clone()),
						);
					}
				}

				let Some(identifier) = mapper::extract_identifier(&resource) else {
					warn!("no identifier for '{}' row {row_id}; skipping", def.name);
					continue;
				};

				let payload = serde_json::to_string(&resource)?;
				match self
					.store
					.enqueue_standard(row_id, &def.fhir_type, &identifier, &payload)
					.await
				{
					Ok(()) => {
						debug!("enqueued {}/{identifier} (row {row_id})", def.fhir_type);
						enqueued += 1;
					}
					Err(e) => warn!(
						"enqueue failed for {}/{identifier} (row {row_id}): {e}",
						def.fhir_type
					),
				}
			}
		}
		Ok(enqueued)
	}

	/// Group, transform and enqueue Consent rows, then mark every staging row
	/// of an enqueued group as processed.
	pub async fn process_consent(&self, def: &ResourceDefinition) -> Result<u64> {
		self.store.ensure_fhir_queue_table().await?;

		if !def.mapping.is_object() {
			warn!("no mappings defined for '{}'; skipping", def.name);
			return Ok(0);
		}

		let rows = self
			.store
			.read_unprocessed_rows(&def.name, &def.group_by, self.batch_limit())
			.await?;
		if rows.is_empty() {
			debug!("no unprocessed consent rows");
			return Ok(0);
		}
		info!("processing {} consent rows", rows.len());

		let groups = consent::group_rows(&rows, &def.group_by);
		info!("grouped into {} consent resources", groups.len());

		let mut enqueued = 0u64;
		for group in &groups {
			let resource =
				match consent::map_consent(group, &def.mapping, &def.required_fields) {
					Ok(Some(r)) => r,
					Ok(None) => continue,
					Err(e) => {
						warn!("mapping error for consent group '{}': {e}", group.key);
						continue;
					}
				};

			let payload = serde_json::to_string(&resource)?;
			if let Err(e) = self
				.store
				.enqueue_consent(&def.fhir_type, &group.key, &payload)
				.await
			{
				warn!("enqueue failed for Consent/{}: {e}", group.key);
				continue;
			}
			enqueued += 1;

			if let Err(e) = self
				.store
				.mark_processed_by_group(&def.name, &def.group_by, &group.key)
				.await
			{
				warn!("could not mark consent group '{}' as processed: {e}", group.key);
			}
		}

		Ok(enqueued)
	}
}
