//! Resource definitions: `resource.yml` lists the resources to fetch, and
//! each resource's mapping file contributes the AQL query template, default
//! query parameters and the FHIR mapping template. Top-level keys inside
//! mapping files are matched case-insensitively, matching how the files are
//! authored in the wild.

use std::collections::HashMap;
use std::path::Path;

use log::warn;
use serde::Deserialize;
use serde_json::Value;

use super::ConfigError;

/// One entry of `resource.yml`.
#[derive(Debug, Clone, Deserialize)]
struct ResourceEntry {
	name: String,
	#[serde(default = "default_priority")]
	priority: i64,
	mapping_file: String,
	#[serde(default)]
	required_fields: Vec<String>,
	#[serde(default = "default_group_by")]
	group_by: String,
}

fn default_priority() -> i64 {
	1
}

fn default_group_by() -> String {
	"composition_id".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct ResourceFile {
	#[serde(default)]
	resources: Vec<ResourceEntry>,
}

/// Per-resource section of a mapping file.
#[derive(Debug, Clone, Deserialize)]
struct MappingSection {
	#[serde(default)]
	query_template: String,
	#[serde(default)]
	parameters: HashMap<String, serde_yaml::Value>,
	#[serde(default)]
	mappings: serde_yaml::Value,
}

/// A fully resolved resource definition, ready for the pipeline.
#[derive(Debug, Clone)]
pub struct ResourceDefinition {
	/// Lowercased name; doubles as the staging table name.
	pub name: String,
	/// Name as written in `resource.yml`, used as the FHIR resourceType.
	pub fhir_type: String,
	pub priority: i64,
	pub required_fields: Vec<String>,
	pub group_by: String,
	pub query_template: String,
	/// Default values for AQL placeholders (`last_run_time`,
	/// `composition_name`, `offset`, `limit`).
	pub parameters: HashMap<String, String>,
	/// FHIR mapping template; string leaves may contain `{{var}}` references.
	pub mapping: Value,
}

impl ResourceDefinition {
	pub fn is_consent(&self) -> bool {
		self.name == "consent"
	}

	/// Default string value for a query parameter.
	pub fn parameter(&self, key: &str) -> Option<&str> {
		self.parameters.get(key).map(String::as_str)
	}
}

/// Load every resource listed in `resource.yml`, resolving mapping files
/// relative to `resource_dir`. A resource with a broken mapping file is a
/// configuration error: the whole load fails rather than silently running a
/// partial pipeline.
pub fn load_resources(
	resource_file: &Path,
	resource_dir: &Path,
) -> Result<Vec<ResourceDefinition>, ConfigError> {
	let raw = std::fs::read_to_string(resource_file).map_err(|e| {
		ConfigError::Resource(format!(
			"cannot read {}: {}",
			resource_file.display(),
			e
		))
	})?;
	let parsed: ResourceFile = serde_yaml::from_str(&raw)
		.map_err(|e| ConfigError::Resource(format!("{}: {}", resource_file.display(), e)))?;

	let mut out = Vec::with_capacity(parsed.resources.len());
	for entry in parsed.resources {
		let mapping_path = resource_dir.join(&entry.mapping_file);
		out.push(load_one(&entry, &mapping_path)?);
	}
	Ok(out)
}

fn load_one(entry: &ResourceEntry, mapping_path: &Path) -> Result<ResourceDefinition, ConfigError> {
	let raw = std::fs::read_to_string(mapping_path).map_err(|e| {
		ConfigError::Resource(format!(
			"mapping file for '{}' not found at {}: {}",
			entry.name,
			mapping_path.display(),
			e
		))
	})?;

	let doc: HashMap<String, MappingSection> = serde_yaml::from_str(&raw)
		.map_err(|e| ConfigError::Resource(format!("{}: {}", mapping_path.display(), e)))?;

	let wanted = entry.name.to_lowercase();
	let section = doc
		.into_iter()
		.find(|(k, _)| k.to_lowercase() == wanted)
		.map(|(_, v)| v)
		.ok_or_else(|| {
			ConfigError::Resource(format!(
				"no section for resource '{}' in {}",
				entry.name,
				mapping_path.display()
			))
		})?;

	if section.query_template.trim().is_empty() {
		return Err(ConfigError::Resource(format!(
			"query_template missing for resource '{}'",
			entry.name
		)));
	}

	let mapping = yaml_to_json(&section.mappings).unwrap_or(Value::Null);
	if !mapping.is_object() {
		warn!(
			"resource '{}' has no usable mappings block; its rows will never be transformed",
			entry.name
		);
	}

	let parameters = section
		.parameters
		.iter()
		.map(|(k, v)| (k.clone(), yaml_scalar_to_string(v)))
		.collect();

	Ok(ResourceDefinition {
		name: wanted,
		fhir_type: entry.name.clone(),
		priority: entry.priority,
		required_fields: entry.required_fields.clone(),
		group_by: entry.group_by.clone(),
		query_template: section.query_template,
		parameters,
		mapping,
	})
}

fn yaml_to_json(v: &serde_yaml::Value) -> Option<Value> {
	serde_json::to_value(v).ok()
}

fn yaml_scalar_to_string(v: &serde_yaml::Value) -> String {
	match v {
		serde_yaml::Value::String(s) => s.clone(),
		serde_yaml::Value::Number(n) => n.to_string(),
		serde_yaml::Value::Bool(b) => b.to_string(),
		serde_yaml::Value::Null => String::new(),
		other => serde_yaml::to_string(other)
			.map(|s| s.trim_end().to_string())
			.unwrap_or_default(),
	}
}
