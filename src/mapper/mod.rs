//! Template-driven mapping from staging rows to FHIR resources.
//!
//! A mapping template is plain JSON (loaded from YAML) whose string leaves
//! may reference row columns as `{{column}}`. Substitution is restricted to
//! named lookups with optional dotted paths into JSON-encoded cells; there is
//! no expression language. After rendering, date fields are normalised to
//! UTC, terminology display names become canonical system URIs, empty
//! branches are pruned and the top-level key order follows the template.

pub mod consent;

use std::collections::HashMap;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::store::StagingRow;

/// Top-level keys holding FHIR dateTime values that need normalising.
const DATE_FIELDS: [&str; 6] = [
	"recordedDate",
	"onsetDateTime",
	"abatementDateTime",
	"effectiveDateTime",
	"performedDateTime",
	"dateTime",
];

static SYSTEM_URIS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
	HashMap::from([
		("SNOMED Clinical Terms", "http://snomed.info/sct"),
		("LOINC", "http://loinc.org"),
		("RxNorm", "http://www.nlm.nih.gov/research/umls/rxnorm"),
		("OPS", "http://fhir.de/CodeSystem/bfarm/ops"),
		("ICD-10", "http://hl7.org/fhir/sid/icd-10"),
		("ICD-10-GM", "http://fhir.de/CodeSystem/bfarm/icd-10-gm"),
		("ATC", "http://www.whocc.no/atc"),
		("UCUM", "http://unitsofmeasure.org"),
	])
});

static PLACEHOLDER: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
	#[error("unsupported template directive in '{0}'")]
	UnknownDirective(String),
}

/// Map one staging row through the template. Returns an empty object when a
/// required field is missing or everything prunes away — the caller skips
/// such rows.
pub fn map_resource(
	row: &StagingRow,
	template: &Value,
	required_fields: &[String],
) -> Result<Value, MapError> {
	if !required_fields_present(row, required_fields) {
		return Ok(Value::Object(Map::new()));
	}

	let mut rendered = render(template, row)?;

	if let Some(obj) = rendered.as_object_mut() {
		normalize_date_fields(obj);
	}
	fix_system_uris(&mut rendered);

	let cleaned = match prune(rendered) {
		Some(v) => v,
		None => return Ok(Value::Object(Map::new())),
	};

	Ok(order_fields(cleaned, template))
}

/// Check the raw row for the configured required fields. A value counts as
/// missing when it is absent, empty, a stringified null, or an empty
/// collection.
pub fn required_fields_present(row: &StagingRow, required_fields: &[String]) -> bool {
	let mut missing: Vec<&str> = Vec::new();
	for field in required_fields {
		let value = row.get(&field.to_lowercase()).map(String::as_str);
		match value {
			Some(v) if !is_empty_text(v) => {}
			_ => missing.push(field),
		}
	}
	if !missing.is_empty() {
		log::warn!("missing required fields: {missing:?}");
		return false;
	}
	true
}

fn is_empty_text(v: &str) -> bool {
	let t = v.trim();
	t.is_empty()
		|| t.eq_ignore_ascii_case("none")
		|| t.eq_ignore_ascii_case("null")
		|| t == "{}"
		|| t == "[]"
}

/// Recursively render a template value against a row.
pub fn render(template: &Value, row: &StagingRow) -> Result<Value, MapError> {
	match template {
		Value::String(s) => substitute(s, row).map(Value::String),
		Value::Object(map) => {
			let mut out = Map::with_capacity(map.len());
			for (k, v) in map {
				out.insert(k.clone(), render(v, row)?);
			}
			Ok(Value::Object(out))
		}
		Value::Array(items) => {
			let mut out = Vec::with_capacity(items.len());
			for item in items {
				out.push(render(item, row)?);
			}
			Ok(Value::Array(out))
		}
		other => Ok(other.clone()),
	}
}

fn substitute(text: &str, row: &StagingRow) -> Result<String, MapError> {
	// Expression blocks and anything that is not a plain lookup are rejected
	// outright; templates carry data, not logic.
	if text.contains("{%") {
		return Err(MapError::UnknownDirective(text.to_string()));
	}

	let replaced = PLACEHOLDER.replace_all(text, |caps: &regex::Captures| {
		lookup_path(row, &caps[1]).unwrap_or_default()
	});

	if replaced.contains("{{") {
		return Err(MapError::UnknownDirective(text.to_string()));
	}
	Ok(replaced.into_owned())
}

/// Look up `name` in the row. A dotted path descends into a JSON-encoded
/// cell: `address.city` reads the `address` column and takes `.city` of the
/// parsed value. A direct column named `address.city` wins if present.
fn lookup_path(row: &StagingRow, name: &str) -> Option<String> {
	let lowered = name.to_lowercase();
	if let Some(direct) = row.get(&lowered) {
		return Some(direct.clone());
	}

	let (head, rest) = lowered.split_once('.')?;
	let parsed: Value = serde_json::from_str(row.get(head)?).ok()?;

	let mut cursor = &parsed;
	for segment in rest.split('.') {
		cursor = match cursor {
			Value::Object(map) => map.get(segment)?,
			Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
			_ => return None,
		};
	}

	Some(match cursor {
		Value::String(s) => s.clone(),
		Value::Null => String::new(),
		other => other.to_string(),
	})
}

/// Parse an ISO-8601 timestamp (with or without fractional seconds, with or
/// without a trailing `Z`) and re-emit it as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn fix_fhir_datetime(raw: &str) -> Option<String> {
	let trimmed = raw.trim().trim_end_matches('Z');
	if is_empty_text(trimmed) {
		return None;
	}

	let parsed = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
		.or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
		.ok()?;

	Some(parsed.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

fn normalize_date_fields(obj: &mut Map<String, Value>) {
	for field in DATE_FIELDS {
		if let Some(value) = obj.get_mut(field) {
			let fixed = value.as_str().and_then(fix_fhir_datetime);
			*value = match fixed {
				Some(s) => Value::String(s),
				None => Value::Null,
			};
		}
	}
}

/// Canonicalise a coding system: known terminology display names map to
/// their URI, bare hosts get an `http://` scheme.
pub fn ensure_valid_uri(system: &str) -> String {
	if is_empty_text(system) {
		return String::new();
	}
	if let Some(canonical) = SYSTEM_URIS.get(system) {
		return (*canonical).to_string();
	}
	if !system.starts_with("http://") && !system.starts_with("https://") {
		return format!("http://{system}");
	}
	system.to_string()
}

/// Walk the whole resource and canonicalise every `coding[].system`.
pub fn fix_system_uris(value: &mut Value) {
	match value {
		Value::Object(map) => {
			for (key, child) in map.iter_mut() {
				if key == "coding" {
					if let Value::Array(codings) = child {
						for coding in codings.iter_mut() {
							if let Some(system) =
								coding.get_mut("system").and_then(|s| s.as_str().map(String::from))
							{
								coding["system"] = Value::String(ensure_valid_uri(&system));
							}
						}
					}
				}
				fix_system_uris(child);
			}
		}
		Value::Array(items) => {
			for item in items.iter_mut() {
				fix_system_uris(item);
			}
		}
		_ => {}
	}
}

/// Drop empty-equivalent values recursively. A list containing only empty
/// objects collapses to nothing.
pub fn prune(value: Value) -> Option<Value> {
	match value {
		Value::Null => None,
		Value::String(s) => {
			if is_empty_text(&s) {
				None
			} else {
				Some(Value::String(s))
			}
		}
		Value::Bool(_) | Value::Number(_) => Some(value),
		Value::Array(items) => {
			let kept: Vec<Value> = items.into_iter().filter_map(prune).collect();
			if kept.is_empty() {
				None
			} else {
				Some(Value::Array(kept))
			}
		}
		Value::Object(map) => {
			let mut kept = Map::new();
			for (k, v) in map {
				if let Some(p) = prune(v) {
					kept.insert(k, p);
				}
			}
			if kept.is_empty() {
				None
			} else {
				Some(Value::Object(kept))
			}
		}
	}
}

/// Reorder top-level keys to match the template declaration order; keys not
/// in the template keep their insertion order at the end.
pub(crate) fn order_fields(resource: Value, template: &Value) -> Value {
	let (Value::Object(mut obj), Value::Object(template_obj)) = (resource, template) else {
		return Value::Object(Map::new());
	};

	let mut ordered = Map::with_capacity(obj.len());
	for key in template_obj.keys() {
		if let Some(v) = obj.shift_remove(key) {
			ordered.insert(key.clone(), v);
		}
	}
	for (k, v) in obj {
		ordered.insert(k, v);
	}
	Value::Object(ordered)
}

/// `identifier[0].value` of a rendered resource, the pipeline's idempotency
/// key.
pub fn extract_identifier(resource: &Value) -> Option<String> {
	let value = resource.get("identifier")?.get(0)?.get("value")?;
	match value {
		Value::String(s) if !s.is_empty() => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

pub fn is_empty_resource(resource: &Value) -> bool {
	match resource {
		Value::Null => true,
		Value::Object(map) => map.is_empty(),
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn row(pairs: &[(&str, &str)]) -> StagingRow {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn renders_simple_substitution() {
		let template = json!({
			"resourceType": "Condition",
			"identifier": [{"value": "{{Composition_ID}}"}],
			"subject": {"reference": "Patient/{{patient_id}}"}
		});
		let r = row(&[("composition_id", "comp-1"), ("patient_id", "p-9")]);

		let out = map_resource(&r, &template, &[]).unwrap();
		assert_eq!(out["identifier"][0]["value"], "comp-1");
		assert_eq!(out["subject"]["reference"], "Patient/p-9");
		assert_eq!(extract_identifier(&out).unwrap(), "comp-1");
	}

	#[test]
	fn empty_code_prunes_to_empty_resource() {
		// scenario: template renders a coding whose code is empty
		let template = json!({
			"code": {"coding": [{"system": "LOINC", "code": "{{c}}"}]}
		});
		let r = row(&[("c", "")]);

		let out = map_resource(&r, &template, &[]).unwrap();
		assert!(is_empty_resource(&out));
	}

	#[test]
	fn missing_required_field_yields_empty() {
		let template = json!({"resourceType": "Condition"});
		let r = row(&[("composition_id", "None")]);
		let required = vec!["Composition_ID".to_string()];

		let out = map_resource(&r, &template, &required).unwrap();
		assert!(is_empty_resource(&out));
	}

	#[test]
	fn date_fields_are_normalised_and_bad_dates_dropped() {
		let template = json!({
			"recordedDate": "{{recorded}}",
			"onsetDateTime": "{{onset}}",
			"note": "{{recorded}}"
		});
		let r = row(&[("recorded", "2024-03-05T07:08:09.123456"), ("onset", "yesterday")]);

		let out = map_resource(&r, &template, &[]).unwrap();
		assert_eq!(out["recordedDate"], "2024-03-05T07:08:09Z");
		// unparseable onset becomes null and is pruned
		assert!(out.get("onsetDateTime").is_none());
		// non-date fields keep the raw text
		assert_eq!(out["note"], "2024-03-05T07:08:09.123456");
	}

	#[test]
	fn fix_fhir_datetime_variants() {
		assert_eq!(
			fix_fhir_datetime("2025-01-01T00:00:00").unwrap(),
			"2025-01-01T00:00:00Z"
		);
		assert_eq!(
			fix_fhir_datetime("2025-01-01T00:00:00.5Z").unwrap(),
			"2025-01-01T00:00:00Z"
		);
		assert!(fix_fhir_datetime("null").is_none());
		assert!(fix_fhir_datetime("2025-01-01").is_none());
	}

	#[test]
	fn coding_systems_are_canonicalised_everywhere() {
		let template = json!({
			"code": {"coding": [{"system": "SNOMED Clinical Terms", "code": "1"}]},
			"category": [
				{"coding": [{"system": "terminology.hl7.org/CodeSystem/x", "code": "2"}]}
			]
		});
		let r = row(&[]);

		let out = map_resource(&r, &template, &[]).unwrap();
		assert_eq!(out["code"]["coding"][0]["system"], "http://snomed.info/sct");
		assert_eq!(
			out["category"][0]["coding"][0]["system"],
			"http://terminology.hl7.org/CodeSystem/x"
		);
	}

	#[test]
	fn list_of_empty_objects_collapses() {
		assert_eq!(prune(json!([{}, {}])), None);
		assert_eq!(prune(json!({"a": {"b": ""}})), None);
		assert_eq!(prune(json!({"a": 0})), Some(json!({"a": 0})));
	}

	#[test]
	fn top_level_keys_follow_template_order() {
		let template = json!({
			"resourceType": "Condition",
			"identifier": [{"value": "{{id}}"}],
			"code": {"text": "{{code}}"}
		});
		let mut r = row(&[("id", "x"), ("code", "y")]);
		r.insert("extra".to_string(), "kept".to_string());

		let out = map_resource(&r, &template, &[]).unwrap();
		let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
		assert_eq!(keys, ["resourceType", "identifier", "code"]);
	}

	#[test]
	fn dotted_paths_descend_into_json_cells() {
		let r = row(&[("context", "{\"facility\": {\"name\": \"Ward 3\"}, \"ids\": [\"a\", \"b\"]}")]);
		let template = json!({"location": "{{context.facility.name}}", "first": "{{context.ids.0}}"});

		let out = map_resource(&r, &template, &[]).unwrap();
		assert_eq!(out["location"], "Ward 3");
		assert_eq!(out["first"], "a");
	}

	#[test]
	fn expression_directives_are_rejected() {
		let template = json!({"a": "{% for x in y %}"});
		let r = row(&[]);
		assert!(matches!(
			map_resource(&r, &template, &[]),
			Err(MapError::UnknownDirective(_))
		));

		let template = json!({"a": "{{not an ident}}"});
		assert!(matches!(
			map_resource(&r, &template, &[]),
			Err(MapError::UnknownDirective(_))
		));
	}

	#[test]
	fn unknown_lookup_renders_empty_and_prunes() {
		let template = json!({"a": "{{missing}}", "b": "kept"});
		let r = row(&[]);
		let out = map_resource(&r, &template, &[]).unwrap();
		assert!(out.get("a").is_none());
		assert_eq!(out["b"], "kept");
	}
}
