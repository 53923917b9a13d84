//! Publisher stage: drain the durable queue and upsert each resource into
//! the FHIR server (search by identifier, then PUT or POST). Outcomes are
//! classified as success, invalid (4xx) or transient; transient failures are
//! retried a bounded number of times at a fixed interval.
//!
//! Non-Consent rows rejected with a 4xx are dequeued by default so a poison
//! pill cannot block the queue (`processing.discard_invalid`). Consent rows
//! are always retained for inspection.

use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use serde_json::Value;

use crate::config::{ResourceDefinition, Settings};
use crate::fhir::{FhirClient, FhirError, UpsertOutcome, fhir_type_name};
use crate::store::{QueueFilter, QueueRow, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendResult {
	Success,
	Invalid,
	Transient,
}

pub struct Publisher {
	store: Store,
	fhir: FhirClient,
	settings: Settings,
}

impl Publisher {
	pub fn new(store: Store, fhir: FhirClient, settings: Settings) -> Self {
		Self {
			store,
			fhir,
			settings,
		}
	}

	fn max_attempts(&self) -> u32 {
		if self.settings.query_retries.enabled {
			self.settings.query_retries.retry_count + 1
		} else {
			1
		}
	}

	async fn send_with_retry(&self, row: &QueueRow) -> SendResult {
		let fhir_type = fhir_type_name(&row.resource_type);

		let mut payload: Value = match serde_json::from_str(&row.resource_data) {
			Ok(v) => v,
			Err(e) => {
				warn!(
					"queued {fhir_type}/{} carries unparseable JSON: {e}",
					row.identifier
				);
				return SendResult::Invalid;
			}
		};

		let attempts = self.max_attempts();
		for attempt in 1..=attempts {
			let outcome = self
				.fhir
				.upsert(&fhir_type, &row.identifier, &mut payload)
				.await;

			match outcome {
				Ok(UpsertOutcome::Success) => return SendResult::Success,
				Ok(UpsertOutcome::Invalid { status, .. }) => {
					warn!(
						"{fhir_type}/{} rejected with HTTP {status}; not retrying",
						row.identifier
					);
					return SendResult::Invalid;
				}
				Ok(UpsertOutcome::ServerError { status, .. }) => {
					warn!(
						"{fhir_type}/{} failed with HTTP {status} (attempt {attempt}/{attempts})",
						row.identifier
					);
				}
				Err(FhirError::SearchFailed { status, .. }) => {
					warn!(
						"identifier search for {fhir_type}/{} failed with HTTP {status} (attempt {attempt}/{attempts})",
						row.identifier
					);
				}
				Err(FhirError::Transport(e)) => {
					warn!(
						"connection error for {fhir_type}/{}: {e} (attempt {attempt}/{attempts})",
						row.identifier
					);
				}
			}

			if attempt < attempts {
				let secs = self.settings.query_retries.retry_interval_seconds;
				tokio::time::sleep(Duration::from_secs(secs)).await;
			}
		}

		SendResult::Transient
	}

	/// Drain the standard queue in batches until it is empty or a pass makes
	/// no progress. Returns the number of rows published.
	pub async fn publish_standard(&self) -> Result<u64> {
		let batch = self.settings.processing.batch_size.max(1);
		let mut total = 0u64;

		loop {
			let rows = self.store.read_queue(QueueFilter::Standard, batch).await?;
			if rows.is_empty() {
				break;
			}

			let mut progressed = false;
			for row in &rows {
				let staging_table = row.resource_type.to_lowercase();
				match self.send_with_retry(row).await {
					SendResult::Success => {
						self.store
							.mark_and_delete_standard(row.id, &staging_table)
							.await?;
						progressed = true;
						total += 1;
					}
					SendResult::Invalid => {
						if self.settings.processing.discard_invalid {
							warn!(
								"dequeuing invalid {}/{} to keep the queue moving",
								row.resource_type, row.identifier
							);
							self.store
								.mark_and_delete_standard(row.id, &staging_table)
								.await?;
							progressed = true;
						} else {
							warn!(
								"retaining invalid {}/{} for inspection",
								row.resource_type, row.identifier
							);
						}
					}
					SendResult::Transient => {
						warn!(
							"temporary failure for {}/{}; will retry next cycle",
							row.resource_type, row.identifier
						);
					}
				}
			}

			if !progressed {
				break;
			}
		}

		info!("published {total} standard resources");
		Ok(total)
	}

	/// Drain Consent queue rows. Successful publishes delete the queue row
	/// and every staging row of the group; invalid rows are always kept.
	pub async fn publish_consent(&self, def: &ResourceDefinition) -> Result<u64> {
		let batch = self.settings.processing.batch_size.max(1);
		let mut total = 0u64;

		loop {
			let rows = self.store.read_queue(QueueFilter::Consent, batch).await?;
			if rows.is_empty() {
				break;
			}

			let mut progressed = false;
			for row in &rows {
				match self.send_with_retry(row).await {
					SendResult::Success => {
						self.store
							.mark_and_delete_consent(
								row.id,
								&def.name,
								&def.group_by,
								&row.identifier,
							)
							.await?;
						progressed = true;
						total += 1;
					}
					SendResult::Invalid => {
						warn!(
							"Consent/{} is invalid; retained in queue for debugging",
							row.identifier
						);
					}
					SendResult::Transient => {
						warn!(
							"temporary failure for Consent/{}; will retry next cycle",
							row.identifier
						);
					}
				}
			}

			if !progressed {
				break;
			}
		}

		info!("published {total} consent resources");
		Ok(total)
	}
}
