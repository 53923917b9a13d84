//! AQL query assembly: resolve the `{{placeholder}}` slots of a resource's
//! query template with the current fetch window and pagination defaults.
//!
//! Substitution is intentionally dumb — named placeholders only, no
//! expressions — so a template can never smuggle logic into the query text.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Date clause removed from templates when date-windowing is disabled.
pub const DATE_WINDOW_CLAUSE: &str =
	"AND c/context/start_time/value < '{{end_run_time}}'";

static PLACEHOLDER: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AqlError {
	#[error("query template is empty")]
	EmptyTemplate,

	#[error("no value for placeholder '{{{{{0}}}}}'")]
	MissingPlaceholder(String),

	#[error("template lacks the date placeholders required for windowed fetching")]
	MissingDatePlaceholders,
}

/// Build a single-line AQL query from a template and a parameter map.
///
/// When `windowed` is true the template must reference both
/// `{{last_run_time}}` and `{{end_run_time}}`; when false, the configured
/// date clause is excised before substitution. Whitespace is collapsed so
/// multi-line YAML templates turn into one query line.
pub fn build_query(
	template: &str,
	parameters: &HashMap<String, String>,
	windowed: bool,
) -> Result<String, AqlError> {
	if template.trim().is_empty() {
		return Err(AqlError::EmptyTemplate);
	}

	let mut query = template.to_string();
	if windowed {
		if !query.contains("{{last_run_time}}") || !query.contains("{{end_run_time}}") {
			return Err(AqlError::MissingDatePlaceholders);
		}
	} else {
		query = query.replace(DATE_WINDOW_CLAUSE, "");
	}

	// Every remaining placeholder must have a value.
	for caps in PLACEHOLDER.captures_iter(&query) {
		let name = &caps[1];
		if !parameters.contains_key(name) {
			return Err(AqlError::MissingPlaceholder(name.to_string()));
		}
	}

	let substituted = PLACEHOLDER.replace_all(&query, |caps: &regex::Captures| {
		parameters
			.get(&caps[1])
			.cloned()
			.unwrap_or_default()
	});

	Ok(substituted.split_whitespace().collect::<Vec<_>>().join(" "))
}
