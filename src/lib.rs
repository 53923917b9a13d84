pub mod aql;
pub mod config;
pub mod ehr;
pub mod fetch;
pub mod fhir;
pub mod health;
pub mod logging;
pub mod mapper;
pub mod orchestrator;
pub mod process;
pub mod publish;
pub mod pseudonym;
pub mod store;

use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use tokio::sync::watch;

use crate::ehr::EhrClient;
use crate::fetch::Fetcher;
use crate::fhir::FhirClient;
use crate::health::HealthCheck;
use crate::orchestrator::Orchestrator;
use crate::process::Processor;
use crate::pseudonym::FieldTransformer;
use crate::publish::Publisher;
use crate::store::Store;

const DEFAULT_POOL_SIZE: u32 = 10;

/// Wire up the pipeline from loaded settings and drive cycles until a
/// cooperative shutdown. Returns `Ok(())` on Ctrl-C so the process exits
/// zero; only unrecoverable initialisation problems surface as errors.
pub async fn run(settings: config::Settings) -> Result<()> {
	let resources = config::load_resources(
		&settings.paths.resource_file,
		&settings.paths.resource_dir,
	)?;
	info!(
		"loaded {} resource definitions ({} consent)",
		resources.len(),
		resources.iter().filter(|r| r.is_consent()).count()
	);

	let store = connect_store(&settings).await?;
	store.ensure_fetch_state_table().await?;
	store.ensure_fhir_queue_table().await?;

	let transformer = if settings.pseudonymization.enabled {
		let key = pseudonym::key::load_or_generate(&settings.pseudonymization.key_path)?;
		FieldTransformer::new(&settings.pseudonymization, key)
	} else {
		FieldTransformer::disabled()
	};

	let ehr = EhrClient::new(settings.ehr.clone()).context("building EHR client")?;
	let fhir = FhirClient::new(settings.fhir.clone()).context("building FHIR client")?;

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("interrupt received; finishing in-flight work");
			let _ = shutdown_tx.send(true);
		}
	});

	let fetcher = Fetcher::new(store.clone(), ehr.clone(), transformer, settings.clone());
	let processor = Processor::new(store.clone(), settings.clone());
	let publisher = Publisher::new(store.clone(), fhir.clone(), settings.clone());
	let health = HealthCheck::new(ehr, fhir, settings.server_health_check.clone());

	let mut orchestrator = Orchestrator::new(
		settings,
		resources,
		fetcher,
		processor,
		publisher,
		health,
		shutdown_rx,
	);
	orchestrator.run().await?;

	store.close().await;
	info!("bifrost stopped");
	Ok(())
}

/// Connect the database pool, retrying while a containerised database comes
/// up. Attempts and backoff follow `BIFROST_DB_CONNECT_RETRIES` and
/// `BIFROST_DB_CONNECT_BACKOFF_MS`.
async fn connect_store(settings: &config::Settings) -> Result<Store> {
	let max_retries: u32 = std::env::var("BIFROST_DB_CONNECT_RETRIES")
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or(30);
	let backoff_ms: u64 = std::env::var("BIFROST_DB_CONNECT_BACKOFF_MS")
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or(1000);

	let mut last_err = None;
	for attempt in 1..=max_retries {
		match Store::connect(&settings.database_url, DEFAULT_POOL_SIZE).await {
			Ok(store) => match store.ping().await {
				Ok(()) => return Ok(store),
				Err(e) => {
					log::warn!("DB ping failed on attempt {attempt}/{max_retries}: {e}");
					last_err = Some(e);
					if attempt < max_retries {
						tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
					}
				}
			},
			Err(e) => {
				log::warn!("DB connect attempt {attempt}/{max_retries} failed: {e}");
				last_err = Some(e);
				if attempt < max_retries {
					tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
				}
			}
		}
	}

	Err(anyhow::anyhow!(
		"could not connect to the database after {max_retries} attempts: {}",
		last_err
			.map(|e| e.to_string())
			.unwrap_or_else(|| "unknown error".to_string())
	))
}
