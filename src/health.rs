//! Pre-cycle health check: probe the EHR and FHIR servers before doing any
//! work. The probe retries at a fixed interval, optionally bounded by
//! `max_retries`; when the EHR never answers, the whole cycle is abandoned
//! so no fetch traffic is sent into a dead backend.

use std::time::Duration;

use log::{info, warn};

use crate::config::HealthCheckSettings;
use crate::ehr::EhrClient;
use crate::fhir::FhirClient;

pub struct HealthCheck {
	ehr: EhrClient,
	fhir: FhirClient,
	settings: HealthCheckSettings,
}

impl HealthCheck {
	pub fn new(ehr: EhrClient, fhir: FhirClient, settings: HealthCheckSettings) -> Self {
		Self {
			ehr,
			fhir,
			settings,
		}
	}

	/// Probe both servers, retrying until healthy or until `max_retries` is
	/// exhausted. Returns false when either server never became reachable.
	pub async fn wait_until_healthy(&self) -> bool {
		if !self.settings.enabled {
			return true;
		}

		if !self.probe_loop("EHR").await {
			return false;
		}
		self.probe_loop("FHIR").await
	}

	async fn probe_loop(&self, label: &str) -> bool {
		let mut attempt: u32 = 0;
		loop {
			attempt += 1;
			let healthy = match label {
				"EHR" => self.ehr.probe().await.unwrap_or(false),
				_ => self.fhir.probe().await.unwrap_or(false),
			};

			if healthy {
				info!("{label} server is online (attempt {attempt})");
				return true;
			}

			if let Some(max) = self.settings.max_retries {
				if attempt >= max {
					warn!("{label} server still unreachable after {attempt} attempts; giving up");
					return false;
				}
			}

			warn!(
				"{label} server unreachable (attempt {attempt}); retrying in {}s",
				self.settings.retry_interval_seconds
			);
			tokio::time::sleep(Duration::from_secs(self.settings.retry_interval_seconds)).await;
		}
	}
}
