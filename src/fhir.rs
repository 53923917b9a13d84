//! HTTP client for the FHIR server: identifier search, create/update of
//! resources, and the `/metadata` health probe.
//!
//! The client performs single attempts and reports a classified outcome;
//! retry policy lives in the publisher.

use std::time::Duration;

use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{AuthMethod, ServerSettings};

const FHIR_CONTENT_TYPE: &str = "application/fhir+json";

#[derive(Debug, Error)]
pub enum FhirError {
	#[error("transport error talking to FHIR server: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("identifier search failed: HTTP {status}: {body}")]
	SearchFailed { status: StatusCode, body: String },
}

/// Classified result of one upsert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
	/// 200/201 from PUT or POST.
	Success,
	/// 4xx: the payload is wrong and will not get better by retrying.
	Invalid { status: StatusCode, body: String },
	/// 5xx: the server had a bad moment; worth retrying.
	ServerError { status: StatusCode, body: String },
}

#[derive(Debug, Deserialize)]
struct SearchBundle {
	#[serde(default)]
	total: u64,
	#[serde(default)]
	entry: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
	resource: SearchResource,
}

#[derive(Debug, Deserialize)]
struct SearchResource {
	id: String,
}

#[derive(Clone)]
pub struct FhirClient {
	http: reqwest::Client,
	base_url: String,
	settings: ServerSettings,
}

impl FhirClient {
	pub fn new(settings: ServerSettings) -> Result<Self, reqwest::Error> {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(30))
			.connect_timeout(Duration::from_secs(10))
			.build()?;
		let base_url = settings.url.trim_end_matches('/').to_string();
		Ok(Self {
			http,
			base_url,
			settings,
		})
	}

	fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match self.settings.auth_method {
			AuthMethod::Basic if !self.settings.user.is_empty() => {
				req.basic_auth(&self.settings.user, Some(&self.settings.password))
			}
			AuthMethod::Basic => req,
			AuthMethod::Bearer => req.bearer_auth(&self.settings.password),
		}
	}

	/// Look up an existing resource by identifier. `Ok(Some(id))` when the
	/// search bundle has at least one hit.
	pub async fn find_by_identifier(
		&self,
		fhir_type: &str,
		identifier: &str,
	) -> Result<Option<String>, FhirError> {
		let url = format!("{}/{}", self.base_url, fhir_type);
		debug!("GET {url}?identifier={identifier}");

		let response = self
			.authorize(self.http.get(&url).query(&[("identifier", identifier)]))
			.send()
			.await?;

		let status = response.status();
		if status != StatusCode::OK {
			return Err(FhirError::SearchFailed {
				status,
				body: response.text().await.unwrap_or_default(),
			});
		}

		let bundle: SearchBundle = response.json().await?;
		if bundle.total > 0 {
			Ok(bundle.entry.first().map(|e| e.resource.id.clone()))
		} else {
			Ok(None)
		}
	}

	/// One search-then-PUT-or-POST attempt. The payload is adjusted in place:
	/// PUT requires the existing server id, POST must not carry one.
	pub async fn upsert(
		&self,
		fhir_type: &str,
		identifier: &str,
		payload: &mut Value,
	) -> Result<UpsertOutcome, FhirError> {
		let existing = self.find_by_identifier(fhir_type, identifier).await?;

		let (response, verb) = match existing {
			Some(id) => {
				if let Some(obj) = payload.as_object_mut() {
					obj.insert("id".to_string(), Value::String(id.clone()));
				}
				let url = format!("{}/{}/{}", self.base_url, fhir_type, id);
				debug!("PUT {url}");
				(
					self.authorize(self.http.put(&url))
						.header(CONTENT_TYPE, FHIR_CONTENT_TYPE)
						.json(payload)
						.send()
						.await?,
					"PUT",
				)
			}
			None => {
				if let Some(obj) = payload.as_object_mut() {
					obj.shift_remove("id");
				}
				let url = format!("{}/{}", self.base_url, fhir_type);
				debug!("POST {url}");
				(
					self.authorize(self.http.post(&url))
						.header(CONTENT_TYPE, FHIR_CONTENT_TYPE)
						.json(payload)
						.send()
						.await?,
					"POST",
				)
			}
		};

		let status = response.status();
		match status {
			StatusCode::OK | StatusCode::CREATED => Ok(UpsertOutcome::Success),
			s if s.is_client_error() => {
				let body = response.text().await.unwrap_or_default();
				warn!("{verb} {fhir_type}/{identifier} rejected: HTTP {s}: {body}");
				Ok(UpsertOutcome::Invalid { status: s, body })
			}
			s => {
				let body = response.text().await.unwrap_or_default();
				Ok(UpsertOutcome::ServerError { status: s, body })
			}
		}
	}

	/// Health probe: `GET /metadata`, healthy on 200.
	pub async fn probe(&self) -> Result<bool, FhirError> {
		let url = format!("{}/metadata", self.base_url);
		let response = self.authorize(self.http.get(&url)).send().await?;
		Ok(response.status() == StatusCode::OK)
	}
}

/// FHIR resource types are addressed in title case regardless of how the
/// resource is spelled in configuration.
pub fn fhir_type_name(resource_type: &str) -> String {
	let mut chars = resource_type.chars();
	match chars.next() {
		Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
		None => String::new(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn type_names_are_title_cased() {
		assert_eq!(fhir_type_name("condition"), "Condition");
		assert_eq!(fhir_type_name("Consent"), "Consent");
		assert_eq!(fhir_type_name("allergyIntolerance"), "AllergyIntolerance");
		assert_eq!(fhir_type_name(""), "");
	}

	#[test]
	fn search_bundle_parses_without_entries() {
		let bundle: SearchBundle = serde_json::from_str("{\"total\": 0}").unwrap();
		assert_eq!(bundle.total, 0);
		assert!(bundle.entry.is_empty());
	}

	#[test]
	fn search_bundle_parses_first_entry_id() {
		let bundle: SearchBundle = serde_json::from_str(
			"{\"total\": 2, \"entry\": [
				{\"resource\": {\"id\": \"abc\"}},
				{\"resource\": {\"id\": \"def\"}}
			]}",
		)
		.unwrap();
		assert_eq!(bundle.entry.first().unwrap().resource.id, "abc");
	}
}
