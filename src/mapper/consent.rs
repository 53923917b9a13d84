//! Consent grouping: multiple staging rows that share a grouping key (one
//! row per signed provision) collapse into a single FHIR Consent whose
//! nested provisions preserve row order.

use log::warn;
use serde_json::{Map, Value, json};

use super::{MapError, fix_fhir_datetime, fix_system_uris, prune, required_fields_present};
use crate::store::StagingRow;

/// Fixed system for consent provision codings.
pub const CONSENT_CODE_SYSTEM: &str = "https://www.medizininformatik-initiative.de/fhir/modul-consent/CodeSystem/mii-cs-consent-consent_code";

/// Columns that describe a single provision rather than the consent itself;
/// they are folded into the provision list instead of the base record.
const PROVISION_COLUMNS: [&str; 7] = [
	"provision_type",
	"consent_code",
	"consent_code_system",
	"start_time",
	"end_time",
	"consent",
	"uri_einwilligungsnachweis",
];

/// One grouped consent: the shared base columns plus the composed top-level
/// provision wrapper.
#[derive(Debug, Clone)]
pub struct ConsentGroup {
	pub key: String,
	pub base: StagingRow,
	pub provision: Value,
	pub provision_count: usize,
}

/// Partition rows by the group column, preserving first-seen group order and
/// row order inside each group. Rows without a group value are dropped.
pub fn group_rows(rows: &[StagingRow], group_by: &str) -> Vec<ConsentGroup> {
	let group_column = group_by.to_lowercase();
	let mut order: Vec<String> = Vec::new();
	let mut buckets: std::collections::HashMap<String, Vec<&StagingRow>> =
		std::collections::HashMap::new();

	for row in rows {
		let key = row
			.get(&group_column)
			.map(|v| v.trim().to_string())
			.unwrap_or_default();
		if key.is_empty() {
			warn!("dropping consent row without '{group_column}' value");
			continue;
		}
		if !buckets.contains_key(&key) {
			order.push(key.clone());
		}
		buckets.entry(key).or_default().push(row);
	}

	order
		.into_iter()
		.map(|key| {
			let members = buckets.remove(&key).unwrap_or_default();
			build_group(key, &members, &group_column)
		})
		.collect()
}

fn build_group(key: String, members: &[&StagingRow], group_column: &str) -> ConsentGroup {
	let first = members.first().copied();

	let mut base = StagingRow::new();
	if let Some(first) = first {
		for (k, v) in first.iter() {
			if !PROVISION_COLUMNS.contains(&k.as_str()) {
				base.insert(k.clone(), v.clone());
			}
		}
	}
	base.insert(group_column.to_string(), key.clone());

	let provisions: Vec<Value> = members.iter().map(|row| provision_entry(row)).collect();

	let mut wrapper = Map::new();
	wrapper.insert(
		"type".to_string(),
		Value::String(
			first
				.and_then(|r| r.get("provision_type"))
				.filter(|t| !t.is_empty())
				.cloned()
				.unwrap_or_else(|| "permit".to_string()),
		),
	);
	if let Some(start) = first
		.and_then(|r| r.get("start_time"))
		.and_then(|s| fix_fhir_datetime(s))
	{
		let mut period = Map::new();
		period.insert("start".to_string(), Value::String(start));
		if let Some(end) = first
			.and_then(|r| r.get("end_time"))
			.and_then(|s| fix_fhir_datetime(s))
		{
			period.insert("end".to_string(), Value::String(end));
		}
		wrapper.insert("period".to_string(), Value::Object(period));
	}
	wrapper.insert(
		"provision".to_string(),
		Value::Array(provisions.clone()),
	);

	ConsentGroup {
		key,
		base,
		provision: Value::Object(wrapper),
		provision_count: provisions.len(),
	}
}

fn provision_entry(row: &StagingRow) -> Value {
	let get = |k: &str| row.get(k).cloned().unwrap_or_default();

	let mut period = Map::new();
	if let Some(start) = fix_fhir_datetime(&get("start_time")) {
		period.insert("start".to_string(), Value::String(start));
	}
	if let Some(end) = fix_fhir_datetime(&get("end_time")) {
		period.insert("end".to_string(), Value::String(end));
	}

	json!({
		"type": get("provision_type"),
		"period": Value::Object(period),
		"code": {
			"coding": [{
				"system": CONSENT_CODE_SYSTEM,
				"code": get("consent_code"),
				"display": get("consent"),
			}]
		},
		"sourceAttachment": {
			"url": get("uri_einwilligungsnachweis"),
		}
	})
}

/// Render one consent group through the mapping template. The structured
/// provision wrapper replaces whatever the template put under `provision`,
/// so templates reference `{{provision}}` without a JSON re-parse.
pub fn map_consent(
	group: &ConsentGroup,
	template: &Value,
	required_fields: &[String],
) -> Result<Option<Value>, MapError> {
	let mut base = group.base.clone();

	// consent_type values arrive as display text ("Patient Consent"); FHIR
	// code bindings want "patient-consent".
	if let Some(ct) = base.get("consent_type").cloned() {
		base.insert(
			"consent_type".to_string(),
			ct.trim().to_lowercase().replace(' ', "-"),
		);
	}

	// Make the wrapper visible to lookups and the required-field check.
	base.insert("provision".to_string(), group.provision.to_string());

	if !required_fields_present(&base, required_fields) {
		warn!("skipping consent group '{}': missing required fields", group.key);
		return Ok(None);
	}

	let mut resource = super::render(template, &base)?;

	if let Some(obj) = resource.as_object_mut() {
		if obj.contains_key("provision") {
			obj.insert("provision".to_string(), group.provision.clone());
		}
		if let Some(raw) = obj.get("dateTime").and_then(|v| v.as_str().map(String::from)) {
			let fixed = fix_fhir_datetime(&raw);
			obj.insert(
				"dateTime".to_string(),
				fixed.map(Value::String).unwrap_or(Value::Null),
			);
		}
	}

	fix_system_uris(&mut resource);

	match prune(resource) {
		Some(cleaned) => Ok(Some(super::order_fields(cleaned, template))),
		None => {
			warn!("empty consent resource after cleaning for '{}'", group.key);
			Ok(None)
		}
	}
}
