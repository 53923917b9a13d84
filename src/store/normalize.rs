//! Row normalisation applied between the raw AQL `resultSet` and the staging
//! tables: every value becomes text (nested structures JSON-encoded), column
//! keys are lowercased, configured fields are sanitized and pseudonymised.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::Sanitize;
use crate::pseudonym::FieldTransformer;

/// Staging rows are plain column→text maps; the table schema evolves to fit.
pub type StagingRow = BTreeMap<String, String>;

const SANITIZE_MAX_LEN: usize = 64;

static DISALLOWED: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\-.]").unwrap());

/// Render one AQL cell as text. Nested structures are JSON-encoded; numbers
/// keep their numeric spelling (staging columns are TEXT, so keys ending in
/// `_string` need no special casing beyond this).
pub fn normalize_value(value: &Value) -> String {
	match value {
		Value::Null => String::new(),
		Value::String(s) => s.clone(),
		Value::Bool(b) => b.to_string(),
		Value::Number(n) => n.to_string(),
		Value::Array(_) | Value::Object(_) => {
			serde_json::to_string(value).unwrap_or_default()
		}
	}
}

/// Identifier hygiene for values that end up in FHIR ids or URLs: `/` becomes
/// `-`, anything outside `[\w\-.]` is stripped, and the result is truncated
/// to 64 characters.
pub fn sanitize_value(value: &str) -> String {
	let replaced = value.replace('/', "-");
	let cleaned = DISALLOWED.replace_all(&replaced, "");
	cleaned.chars().take(SANITIZE_MAX_LEN).collect()
}

/// Normalise a raw AQL row into a staging row: lowercase keys, stringify
/// values, sanitize configured fields, then apply the field transformer
/// (which may add `<field>_ciphertext` companion columns).
pub fn normalize_row(
	raw: &serde_json::Map<String, Value>,
	sanitize: &Sanitize,
	transformer: &FieldTransformer,
) -> StagingRow {
	let mut row: StagingRow = BTreeMap::new();

	for (key, value) in raw {
		let column = key.to_lowercase();
		let mut text = normalize_value(value);

		if sanitize.enabled && sanitize.elements_to_sanitize.iter().any(|f| f.to_lowercase() == column) {
			text = sanitize_value(&text);
		}

		if let Some(t) = transformer.transform(&column, &text) {
			row.insert(format!("{column}_ciphertext"), t.ciphertext);
			text = t.handle;
		}

		row.insert(column, text);
	}

	row
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn values_become_text_and_nested_json() {
		assert_eq!(normalize_value(&Value::Null), "");
		assert_eq!(normalize_value(&json!("x")), "x");
		assert_eq!(normalize_value(&json!(3.5)), "3.5");
		assert_eq!(normalize_value(&json!(42)), "42");
		assert_eq!(normalize_value(&json!(true)), "true");
		assert_eq!(normalize_value(&json!({"k": [1, 2]})), "{\"k\":[1,2]}");
	}

	#[test]
	fn sanitize_replaces_slashes_and_strips_junk() {
		assert_eq!(sanitize_value("abc/def"), "abc-def");
		assert_eq!(sanitize_value("a b(c)!"), "abc");
		assert_eq!(sanitize_value("ehr.id/1234::node"), "ehr.id-1234node");

		let long = "x".repeat(100);
		assert_eq!(sanitize_value(&long).len(), 64);
	}

	#[test]
	fn row_keys_are_lowercased_and_sanitized_fields_applied() {
		let mut raw = serde_json::Map::new();
		raw.insert("Composition_ID".to_string(), json!("abc/def::1"));
		raw.insert("Value".to_string(), json!(7));

		let sanitize = Sanitize {
			enabled: true,
			elements_to_sanitize: vec!["composition_id".to_string()],
		};
		let row = normalize_row(&raw, &sanitize, &FieldTransformer::disabled());

		assert_eq!(row.get("composition_id").unwrap(), "abc-def1");
		assert_eq!(row.get("value").unwrap(), "7");
	}

	#[test]
	fn transformer_adds_ciphertext_column() {
		use crate::config::{FieldRule, Pseudonymization};

		let mut cfg = Pseudonymization::default();
		cfg.enabled = true;
		cfg.elements_to_pseudonymize.insert(
			"patient_id".to_string(),
			FieldRule {
				enabled: true,
				prefix: "pid-".to_string(),
				domain: None,
			},
		);
		let t = FieldTransformer::new(&cfg, [0u8; 32]);

		let mut raw = serde_json::Map::new();
		raw.insert("Patient_ID".to_string(), json!("12345"));

		let row = normalize_row(&raw, &Sanitize::default(), &t);
		assert!(row.get("patient_id").unwrap().starts_with("pid-"));
		assert!(row.contains_key("patient_id_ciphertext"));
		assert_ne!(row.get("patient_id").unwrap(), "12345");
	}
}
