use std::path::PathBuf;

use serde_json::json;

use metamerge_recon::config::ReconConfig;
use metamerge_recon::engine::{run, run_with, RunOptions};
use metamerge_recon::input::load_records;
use metamerge_recon::model::{ReconInput, ReconResult, SourceInput};
use metamerge_recon::{ReconError, Value};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn load_config() -> ReconConfig {
    let toml = std::fs::read_to_string(fixtures_dir().join("subjects.recon.toml")).unwrap();
    ReconConfig::from_toml(&toml).unwrap()
}

fn load_input(config: &ReconConfig, files: &[(&str, &str)]) -> Result<ReconInput, ReconError> {
    let dir = fixtures_dir();
    let mut sources = Vec::new();
    for (source, file) in files {
        let path = dir.join(file);
        let data = std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()));
        sources.push(SourceInput {
            source: source.to_string(),
            records: load_records(source, &data, config)?,
        });
    }
    Ok(ReconInput { sources })
}

fn load_and_run() -> ReconResult {
    let config = load_config();
    let files: Vec<(&str, &str)> = config
        .sources
        .iter()
        .map(|(source, sc)| (source.as_str(), sc.file.as_str()))
        .collect();
    let input = load_input(&config, &files).unwrap();
    run(&config, &input).unwrap()
}

fn record_json(result: &ReconResult, id: &str) -> serde_json::Value {
    let record = result
        .records
        .iter()
        .find(|r| r.value("id") == &Value::from(id))
        .unwrap_or_else(|| panic!("no merged record for {id}"));
    serde_json::to_value(record).unwrap()
}

// -------------------------------------------------------------------------
// Merged records
// -------------------------------------------------------------------------

#[test]
fn nested_specimens_merge_by_identity() {
    let result = load_and_run();
    assert_eq!(
        record_json(&result, "P1"),
        json!({
            "id": "P1",
            "race": "White",
            "sex": null,
            "identifiers": [],
            "diagnoses": null,
            "specimens": [
                {"id": "S1", "type": "tumor"},
                {"id": "S2", "type": "normal"},
            ],
        })
    );
}

#[test]
fn deep_nesting_uses_field_priority() {
    let result = load_and_run();
    let p3 = record_json(&result, "P3");

    assert_eq!(
        p3["identifiers"],
        json!([
            {"system": "A", "value": "a-3"},
            {"system": "B", "value": "b-3"},
        ])
    );
    assert_eq!(p3["race"], json!("not reported"));
    assert_eq!(
        p3["diagnoses"],
        json!([{
            "diagnosis_id": "D1",
            "primary_site": {"text": "Cerebrum", "coding": ["C71"]},
            "treatments": [
                {"id": "T1", "therapy": ["radiation", "temozolomide"]},
                {"id": "T2", "therapy": ["surgery"]},
            ],
        }])
    );
}

#[test]
fn singleton_is_projected_to_spec() {
    let result = load_and_run();
    let p4 = record_json(&result, "P4");
    assert_eq!(p4["race"], json!("Asian"));
    assert!(p4.get("extra").is_none());
    assert_eq!(p4.as_object().unwrap().len(), 6);
}

#[test]
fn records_sorted_by_identity() {
    let result = load_and_run();
    let ids: Vec<String> = result.records.iter().map(|r| r.value("id").to_string()).collect();
    assert_eq!(ids, ["P1", "P2", "P3", "P4"]);
}

// -------------------------------------------------------------------------
// Conflict report
// -------------------------------------------------------------------------

#[test]
fn sex_disagreement_is_the_only_conflict() {
    let result = load_and_run();
    let report = &result.report;

    assert_eq!(report.conflicts.len(), 1);
    let c = &report.conflicts[0];
    assert_eq!(
        (
            c.identity.to_string(),
            c.field.as_str(),
            c.cached.to_string(),
            c.observed.to_string()
        ),
        ("P2".to_string(), "sex", "female".to_string(), "male".to_string())
    );

    let sex = report
        .resolutions
        .iter()
        .find(|r| r.field == "sex")
        .expect("sex resolution");
    assert_eq!(sex.discarded_source, "B");
    assert_eq!(record_json(&result, "P2")["sex"], json!("female"));
}

#[test]
fn discarded_primary_site_text_is_resolved() {
    let result = load_and_run();
    let sites: Vec<_> = result
        .report
        .resolutions
        .iter()
        .filter(|r| r.field == "primary_site")
        .collect();
    assert_eq!(sites.len(), 1);
    let site = sites[0];
    assert_eq!(site.entity, "Diagnosis");
    assert_eq!(site.identity, Value::from("D1"));
    assert_eq!((site.kept_source.as_str(), &site.kept), ("B", &Value::from("Cerebrum")));
    assert_eq!(
        (site.discarded_source.as_str(), &site.discarded),
        ("A", &Value::from("Brain"))
    );

    // Diagnosis sorts ahead of Subject.
    let entities: Vec<&str> = result.report.resolutions.iter().map(|r| r.entity.as_str()).collect();
    assert_eq!(entities, ["Diagnosis", "Subject"]);
}

#[test]
fn distinct_values_tracked_per_field() {
    let result = load_and_run();
    let distinct = &result.report.distinct_values;
    assert_eq!(
        distinct["sex"],
        vec![Value::from("female"), Value::from("male"), Value::Null]
    );
    assert_eq!(
        distinct["race"],
        vec![Value::from("Asian"), Value::from("White"), Value::Null]
    );
}

#[test]
fn summary_counts() {
    let result = load_and_run();
    assert_eq!(result.meta.config_name, "Subject Merge");
    assert_eq!(result.meta.root_entity, "Subject");
    assert_eq!(result.summary.input_records, 7);
    assert_eq!(result.summary.identities, 4);
    assert_eq!(result.summary.merged, 3);
    assert_eq!(result.summary.passed_through, 1);
    assert_eq!(result.summary.conflicts, 1);
    assert_eq!(result.summary.resolutions, 2);
}

// -------------------------------------------------------------------------
// Failures
// -------------------------------------------------------------------------

#[test]
fn nested_child_without_identity_aborts_run() {
    let config = load_config();
    let input = load_input(&config, &[("A", "subjects-a.jsonl"), ("C", "orphan-specimen.jsonl")]).unwrap();
    let err = run(&config, &input).unwrap_err();
    match err {
        ReconError::MissingIdentity {
            entity,
            source_tag,
            context,
            ..
        } => {
            assert_eq!(entity, "Specimen");
            assert_eq!(source_tag, "C");
            assert_eq!(context, "Subject P9 -> specimens");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn top_level_record_without_identity_aborts_run() {
    let config = load_config();
    let input = load_input(&config, &[("A", "no-identity.jsonl")]).unwrap();
    let err = run(&config, &input).unwrap_err();
    assert!(matches!(err, ReconError::MissingIdentity { ref entity, .. } if entity == "Subject"));
}

#[test]
fn duplicate_records_in_one_stream_merge() {
    let config = load_config();
    let input = load_input(&config, &[("A", "subjects-a.jsonl"), ("A", "subjects-b.jsonl")]).unwrap();
    let result = run(&config, &input).unwrap();

    // Second A stream ranks right behind the first.
    let p2 = record_json(&result, "P2");
    assert_eq!(p2["sex"], json!("female"));
    assert_eq!(result.report.conflicts[0].observed_source, "A#2");
    assert_eq!(result.meta.sources, ["A"]);
}

#[test]
fn parallel_run_matches_sequential() {
    let config = load_config();
    let input = load_input(&config, &[("A", "subjects-a.jsonl"), ("B", "subjects-b.jsonl")]).unwrap();
    let sequential = run(&config, &input).unwrap();
    let parallel = run_with(
        &config,
        &input,
        &RunOptions {
            workers: 3,
            cancel: None,
        },
    )
    .unwrap();
    assert_eq!(sequential.records, parallel.records);
    assert_eq!(sequential.report.conflicts, parallel.report.conflicts);
    assert_eq!(sequential.report.resolutions, parallel.report.resolutions);
}
