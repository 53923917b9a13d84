//! Fetcher stage: per resource, resolve the next time window, run the AQL
//! query, normalise and stage the returned rows, then advance the fetch
//! state. The state update is the final action of a successful window — a
//! failed staging insert leaves the window to be retried.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use log::{debug, error, info, warn};

use crate::aql;
use crate::config::{ResourceDefinition, Settings};
use crate::ehr::{EhrClient, QueryOutcome};
use crate::pseudonym::FieldTransformer;
use crate::store::{Store, normalize};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One half-open fetch window `[start, end)` plus the state to record after
/// the window succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchWindow {
	pub start: String,
	pub end: String,
	pub next_run: String,
}

fn parse_time(s: &str) -> Option<NaiveDateTime> {
	NaiveDateTime::parse_from_str(s.trim(), TIME_FORMAT).ok()
}

/// Compute the next window from the persisted fetch state. Successive
/// windows are contiguous: a new resource starts at the configured
/// `start_date`, afterwards each window begins where the previous one ended
/// (`next_run_time`). The window end is clamped to `end_date`; once the
/// start reaches the end there is nothing left to fetch.
pub fn compute_window(
	state: Option<&(String, String)>,
	start_date: &str,
	end_date: Option<&str>,
	interval_hours: i64,
) -> Option<FetchWindow> {
	let start_str = match state {
		Some((_, next_run)) if !next_run.is_empty() => next_run.clone(),
		_ => start_date.to_string(),
	};
	let start = parse_time(&start_str)?;

	let mut end = start + ChronoDuration::hours(interval_hours);
	if let Some(end_date) = end_date.and_then(parse_time) {
		if end > end_date {
			end = end_date;
		}
	}

	if start >= end {
		return None;
	}

	let end_str = end.format(TIME_FORMAT).to_string();
	Some(FetchWindow {
		start: start.format(TIME_FORMAT).to_string(),
		end: end_str.clone(),
		next_run: end_str,
	})
}

/// Which resources a fetch pass covers. Consent is fetched in its own stage
/// of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPass {
	Standard,
	Consent,
}

pub struct Fetcher {
	store: Store,
	ehr: EhrClient,
	transformer: FieldTransformer,
	settings: Settings,
}

impl Fetcher {
	pub fn new(
		store: Store,
		ehr: EhrClient,
		transformer: FieldTransformer,
		settings: Settings,
	) -> Self {
		Self {
			store,
			ehr,
			transformer,
			settings,
		}
	}

	/// Fetch every resource of the pass, up to `max_parallel_fetches` at a
	/// time. A failing resource never affects the others.
	pub async fn fetch_all(&self, resources: &[ResourceDefinition], pass: FetchPass) {
		let mut targets: Vec<&ResourceDefinition> = Vec::new();
		for def in resources {
			let wanted = match pass {
				FetchPass::Standard => !def.is_consent(),
				FetchPass::Consent => def.is_consent(),
			};
			if !wanted {
				continue;
			}
			match self.priority_gated(def).await {
				Ok(true) => {
					info!(
						"skipping '{}': priority {} interval not yet elapsed",
						def.name, def.priority
					);
				}
				Ok(false) => targets.push(def),
				Err(e) => {
					warn!("priority check failed for '{}': {e}; fetching anyway", def.name);
					targets.push(def);
				}
			}
		}

		let parallel = self.settings.polling.max_parallel_fetches.max(1);
		stream::iter(targets)
			.for_each_concurrent(parallel, |def| async move {
				if let Err(e) = self.fetch_resource(def).await {
					error!("fetch failed for '{}': {e:#}", def.name);
				}
			})
			.await;
	}

	/// True when priority-based fetching says this resource ran recently
	/// enough to sit this cycle out.
	async fn priority_gated(&self, def: &ResourceDefinition) -> Result<bool> {
		let Some(interval_minutes) = self.settings.priority_interval_minutes(def.priority)
		else {
			return Ok(false);
		};

		let Some((last_run, _)) = self.store.get_fetch_state(&def.name).await? else {
			return Ok(false);
		};
		let Some(last_run) = parse_time(&last_run) else {
			return Ok(false);
		};

		let elapsed = Utc::now().naive_utc() - last_run;
		Ok(elapsed.num_minutes() < interval_minutes)
	}

	async fn fetch_resource(&self, def: &ResourceDefinition) -> Result<()> {
		let windowed = self.settings.fetch_by_date.enabled;

		let mut parameters: HashMap<String, String> = def.parameters.clone();
		parameters
			.entry("composition_name".to_string())
			.or_default();
		parameters
			.entry("offset".to_string())
			.or_insert_with(|| "0".to_string());
		parameters
			.entry("limit".to_string())
			.or_insert_with(|| "100".to_string());

		let state_update: Option<(String, String)>;
		if windowed {
			let state = self.store.get_fetch_state(&def.name).await?;
			let window = compute_window(
				state.as_ref(),
				&self.settings.fetch_by_date.start_date,
				self.settings.fetch_by_date.end_date.as_deref(),
				self.settings.fetch_by_date.fetch_interval_hours,
			);
			let Some(window) = window else {
				debug!("'{}': window exhausted or start date unparseable; skipping", def.name);
				return Ok(());
			};
			info!("fetching '{}' | {} -> {}", def.name, window.start, window.end);
			parameters.insert("last_run_time".to_string(), window.start.clone());
			parameters.insert("end_run_time".to_string(), window.end.clone());
			state_update = Some((window.start, window.next_run));
		} else {
			let start = parameters
				.get("last_run_time")
				.cloned()
				.unwrap_or_else(|| self.settings.fetch_by_date.start_date.clone());
			info!("polling '{}' from {}", def.name, start);
			parameters.insert("last_run_time".to_string(), start.clone());
			parameters.insert("end_run_time".to_string(), String::new());

			// Without windowing the state row is bookkeeping only: it records
			// the poll start and the next poll due time.
			let next = parse_time(&start)
				.map(|t| {
					(t + ChronoDuration::seconds(self.settings.polling.interval_seconds as i64))
						.format(TIME_FORMAT)
						.to_string()
				})
				.unwrap_or_else(|| start.clone());
			state_update = Some((start, next));
		}

		let query = aql::build_query(&def.query_template, &parameters, windowed)
			.with_context(|| format!("building AQL for '{}'", def.name))?;

		match self.ehr.query(&query).await {
			Ok(QueryOutcome::Rows(rows)) => {
				if rows.is_empty() {
					info!("no new records for '{}'", def.name);
				} else {
					let staged: Vec<normalize::StagingRow> = rows
						.iter()
						.map(|r| {
							normalize::normalize_row(
								r,
								&self.settings.sanitize,
								&self.transformer,
							)
						})
						.collect();
					let inserted =
						self.store.insert_staging_rows(&def.name, &staged).await?;
					info!("staged {inserted} rows for '{}'", def.name);
				}
				// The window advances even when it was empty; emptiness is an
				// answer, not a failure.
				if let Some((last, next)) = state_update {
					self.store.update_fetch_state(&def.name, &last, &next).await?;
				}
				Ok(())
			}
			Ok(QueryOutcome::NoContent) => {
				warn!("'{}': EHR returned 204 No Content; fetch state unchanged", def.name);
				Ok(())
			}
			Err(e) if e.is_transient() => {
				warn!("'{}': transient EHR failure: {e}; fetch state unchanged", def.name);
				Ok(())
			}
			Err(e) => {
				error!("'{}': EHR rejected query: {e}; window skipped without advancing", def.name);
				Ok(())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_window_starts_at_configured_date() {
		let w = compute_window(None, "2025-01-01T00:00:00", None, 6).unwrap();
		assert_eq!(w.start, "2025-01-01T00:00:00");
		assert_eq!(w.end, "2025-01-01T06:00:00");
		assert_eq!(w.next_run, "2025-01-01T06:00:00");
	}

	#[test]
	fn windows_are_contiguous() {
		let first = compute_window(None, "2025-01-01T00:00:00", None, 6).unwrap();
		let state = ("2025-01-01T00:00:00".to_string(), first.next_run.clone());
		let second = compute_window(Some(&state), "2025-01-01T00:00:00", None, 6).unwrap();
		assert_eq!(second.start, first.end);
		assert_eq!(second.end, "2025-01-01T12:00:00");
	}

	#[test]
	fn window_is_clamped_at_end_date_and_not_reissued() {
		// interval reaches past the configured end: clamp
		let w = compute_window(
			None,
			"2025-01-01T00:00:00",
			Some("2025-01-01T05:00:00"),
			6,
		)
		.unwrap();
		assert_eq!(w.end, "2025-01-01T05:00:00");
		assert_eq!(w.next_run, "2025-01-01T05:00:00");

		// next cycle starts at the clamped end: nothing left
		let state = ("2025-01-01T00:00:00".to_string(), w.next_run.clone());
		assert_eq!(
			compute_window(
				Some(&state),
				"2025-01-01T00:00:00",
				Some("2025-01-01T05:00:00"),
				6,
			),
			None
		);
	}

	#[test]
	fn unparseable_start_yields_no_window() {
		assert_eq!(compute_window(None, "soon", None, 6), None);
	}
}
