//! HTTP client for the openEHR server: AQL queries against
//! `/rest/v1/query` and the heartbeat probe used by the pre-cycle health
//! check.

use std::time::Duration;

use log::debug;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::{AuthMethod, ServerSettings};

#[derive(Debug, Error)]
pub enum EhrError {
	#[error("transport error talking to EHR server: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("EHR server rejected the query: HTTP {status}: {body}")]
	Rejected { status: StatusCode, body: String },

	#[error("EHR server error: HTTP {status}: {body}")]
	Server { status: StatusCode, body: String },
}

impl EhrError {
	/// Transient errors leave the fetch window untouched and are retried by
	/// the next cycle; rejections skip the window without advancing state.
	pub fn is_transient(&self) -> bool {
		matches!(self, EhrError::Transport(_) | EhrError::Server { .. })
	}
}

#[derive(Debug, Serialize)]
struct AqlRequest<'a> {
	aql: &'a str,
}

#[derive(Debug, Deserialize)]
struct AqlResponse {
	#[serde(rename = "resultSet", default)]
	result_set: Vec<serde_json::Map<String, Value>>,
}

/// Outcome of one AQL query. HTTP 204 is not an error: the server reports an
/// empty result without a body, and the fetch state must not advance.
#[derive(Debug)]
pub enum QueryOutcome {
	Rows(Vec<serde_json::Map<String, Value>>),
	NoContent,
}

#[derive(Clone)]
pub struct EhrClient {
	http: reqwest::Client,
	base_url: String,
	settings: ServerSettings,
}

impl EhrClient {
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
			AuthMethod::Basic => {
				req.basic_auth(&self.settings.user, Some(&self.settings.password))
			}
			AuthMethod::Bearer => req.bearer_auth(&self.settings.password),
		}
	}

	/// POST an AQL query and return the raw `resultSet` rows.
	pub async fn query(&self, aql: &str) -> Result<QueryOutcome, EhrError> {
		let url = format!("{}/rest/v1/query", self.base_url);
		debug!("POST {url}");

		let response = self
			.authorize(self.http.post(&url))
			.json(&AqlRequest { aql })
			.send()
			.await?;

		let status = response.status();
		match status {
			StatusCode::OK => {
				let parsed: AqlResponse = response.json().await?;
				Ok(QueryOutcome::Rows(parsed.result_set))
			}
			StatusCode::NO_CONTENT => Ok(QueryOutcome::NoContent),
			s if s.is_client_error() => Err(EhrError::Rejected {
				status: s,
				body: truncate_body(response.text().await.unwrap_or_default()),
			}),
			s => Err(EhrError::Server {
				status: s,
				body: truncate_body(response.text().await.unwrap_or_default()),
			}),
		}
	}

	/// Heartbeat: `OPTIONS /rest/v1/ehr`, healthy on 200 or 204.
	pub async fn probe(&self) -> Result<bool, EhrError> {
		let url = format!("{}/rest/v1/ehr", self.base_url);
		let response = self
			.authorize(self.http.request(reqwest::Method::OPTIONS, &url))
			.send()
			.await?;
		Ok(matches!(
			response.status(),
			StatusCode::OK | StatusCode::NO_CONTENT
		))
	}
}

fn truncate_body(body: String) -> String {
	const MAX: usize = 300;
	if body.len() > MAX {
		let mut end = MAX;
		while !body.is_char_boundary(end) {
			end -= 1;
		}
		format!("{}…", &body[..end])
	} else {
		body
	}
}
