/// Shared helpers for integration tests: a throwaway SQLite-backed store and
/// ready-made resource definitions.
use std::collections::HashMap;

use bifrost::config::ResourceDefinition;
use bifrost::store::Store;
use serde_json::json;
use tempfile::TempDir;

/// Open a store against a fresh SQLite database in a temp directory. The
/// TempDir must stay alive for the duration of the test.
pub async fn test_store() -> (Store, TempDir) {
	let dir = TempDir::new().expect("create temp dir");
	let url = format!(
		"sqlite://{}?mode=rwc",
		dir.path().join("bifrost-test.db").display()
	);
	let store = Store::connect(&url, 5).await.expect("connect sqlite store");
	store.ensure_fetch_state_table().await.expect("fetch_state ddl");
	store.ensure_fhir_queue_table().await.expect("fhir_queue ddl");
	(store, dir)
}

#[allow(dead_code)]
pub fn condition_definition() -> ResourceDefinition {
	let mut parameters = HashMap::new();
	parameters.insert("composition_name".to_string(), "Diagnose".to_string());
	parameters.insert("offset".to_string(), "0".to_string());
	parameters.insert("limit".to_string(), "100".to_string());

	ResourceDefinition {
		name: "condition".to_string(),
		fhir_type: "Condition".to_string(),
		priority: 1,
		required_fields: vec!["Composition_ID".to_string()],
		group_by: "composition_id".to_string(),
		query_template: "SELECT c/uid/value AS Composition_ID FROM COMPOSITION c \
			WHERE c/name/value = '{{composition_name}}' \
			AND c/context/start_time/value >= '{{last_run_time}}' \
			AND c/context/start_time/value < '{{end_run_time}}' \
			OFFSET {{offset}} LIMIT {{limit}}"
			.to_string(),
		parameters,
		mapping: json!({
			"resourceType": "Condition",
			"identifier": [{"value": "{{Composition_ID}}"}],
			"code": {"coding": [{"system": "{{Diagnose_System}}", "code": "{{Diagnose_Code}}"}]},
			"subject": {"reference": "Patient/{{Patient_ID}}"}
		}),
	}
}

#[allow(dead_code)]
pub fn consent_definition() -> ResourceDefinition {
	let mut parameters = HashMap::new();
	parameters.insert("composition_name".to_string(), "Einwilligung".to_string());

	ResourceDefinition {
		name: "consent".to_string(),
		fhir_type: "Consent".to_string(),
		priority: 2,
		required_fields: vec!["composition_id".to_string()],
		group_by: "composition_id".to_string(),
		query_template: "SELECT c/uid/value AS composition_id FROM COMPOSITION c \
			WHERE c/name/value = '{{composition_name}}' \
			AND c/context/start_time/value >= '{{last_run_time}}' \
			AND c/context/start_time/value < '{{end_run_time}}' \
			OFFSET {{offset}} LIMIT {{limit}}"
			.to_string(),
		parameters,
		mapping: json!({
			"resourceType": "Consent",
			"identifier": [{"value": "{{composition_id}}"}],
			"status": "active",
			"patient": {"reference": "Patient/{{patient_id}}"},
			"dateTime": "{{consent_datetime}}",
			"provision": "{{provision}}"
		}),
	}
}

/// Insert consent staging rows directly, simulating a completed fetch.
#[allow(dead_code)]
pub async fn stage_consent_rows(store: &Store, rows: &[(&str, &str, &str)]) {
	use bifrost::store::StagingRow;

	let staged: Vec<StagingRow> = rows
		.iter()
		.map(|(cid, ptype, code)| {
			[
				("composition_id", *cid),
				("patient_id", "p-1"),
				("consent_type", "Patient Consent"),
				("provision_type", *ptype),
				("consent_code", *code),
				("consent", "display"),
				("start_time", "2024-01-01T10:00:00"),
				("end_time", ""),
				("uri_einwilligungsnachweis", "http://docs/x.pdf"),
				("consent_datetime", "2024-01-01T10:00:00"),
			]
			.into_iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
		})
		.collect();

	store
		.insert_staging_rows("consent", &staged)
		.await
		.expect("stage consent rows");
}
