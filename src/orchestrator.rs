//! Cycle driver: HealthCheck → FetchStandard → ProcessStandard →
//! PublishStandard → FetchConsent → ProcessConsent → PublishConsent → Sleep.
//!
//! A failing stage is logged and the remaining stages still run; only a
//! failed health check abandons the cycle. Consent stages run only when a
//! Consent resource is configured. Shutdown is cooperative: it is honoured
//! between stages and during the sleep, never in the middle of an HTTP call.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{error, info, warn};
use tokio::sync::watch;

use crate::config::{ResourceDefinition, Settings};
use crate::fetch::{FetchPass, Fetcher};
use crate::health::HealthCheck;
use crate::process::Processor;
use crate::publish::Publisher;

pub struct Orchestrator {
	settings: Settings,
	resources: Vec<ResourceDefinition>,
	fetcher: Fetcher,
	processor: Processor,
	publisher: Publisher,
	health: HealthCheck,
	shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
	pub fn new(
		settings: Settings,
		resources: Vec<ResourceDefinition>,
		fetcher: Fetcher,
		processor: Processor,
		publisher: Publisher,
		health: HealthCheck,
		shutdown: watch::Receiver<bool>,
	) -> Self {
		Self {
			settings,
			resources,
			fetcher,
			processor,
			publisher,
			health,
			shutdown,
		}
	}

	fn stopping(&self) -> bool {
		*self.shutdown.borrow()
	}

	/// Run cycles until shutdown, or exactly one cycle when polling is
	/// disabled.
	pub async fn run(&mut self) -> Result<()> {
		loop {
			if self.stopping() {
				break;
			}
			self.cycle().await;

			if !self.settings.polling.enabled {
				info!("polling disabled; exiting after one cycle");
				break;
			}
			if self.stopping() {
				break;
			}

			let interval = Duration::from_secs(self.settings.polling.interval_seconds);
			info!("waiting {}s before next cycle", interval.as_secs());
			tokio::select! {
				_ = tokio::time::sleep(interval) => {}
				_ = self.shutdown.changed() => {
					info!("shutdown requested during sleep");
					break;
				}
			}
		}
		Ok(())
	}

	async fn cycle(&self) {
		let cycle_start = Instant::now();
		info!("cycle started");

		if !self.health.wait_until_healthy().await {
			warn!("health check failed; skipping this cycle");
			return;
		}
		if self.stopping() {
			return;
		}

		step("fetching standard resources", async {
			self.fetcher
				.fetch_all(&self.resources, FetchPass::Standard)
				.await;
			Ok(())
		})
		.await;
		if self.stopping() {
			return;
		}

		step("processing standard resources", self.processor.process_standard(&self.resources))
			.await;
		if self.stopping() {
			return;
		}

		step("publishing standard resources", self.publisher.publish_standard()).await;
		if self.stopping() {
			return;
		}

		if let Some(consent) = self.resources.iter().find(|d| d.is_consent()) {
			step("fetching consent resource", async {
				self.fetcher
					.fetch_all(&self.resources, FetchPass::Consent)
					.await;
				Ok(())
			})
			.await;
			if self.stopping() {
				return;
			}

			step("processing consent resources", self.processor.process_consent(consent))
				.await;
			if self.stopping() {
				return;
			}

			step("publishing consent resources", self.publisher.publish_consent(consent))
				.await;
		}

		info!(
			"cycle completed in {:.2}s",
			cycle_start.elapsed().as_secs_f64()
		);
	}
}

/// Run one pipeline stage with timing; a stage error is logged and swallowed
/// so the remaining stages still run.
async fn step<T, F>(description: &str, fut: F) -> Option<T>
where
	F: Future<Output = Result<T>>,
{
	let start = Instant::now();
	info!("starting: {description}");
	match fut.await {
		Ok(value) => {
			info!(
				"completed: {description} in {:.2}s",
				start.elapsed().as_secs_f64()
			);
			Some(value)
		}
		Err(e) => {
			error!(
				"error during {description} after {:.2}s: {e:#}",
				start.elapsed().as_secs_f64()
			);
			None
		}
	}
}
