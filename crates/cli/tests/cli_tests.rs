// Contract tests for the `metamerge` binary: exit codes, stdout JSON, output files.
//
// Run with: cargo test -p metamerge-cli --test cli_tests -- --nocapture

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn metamerge() -> Command {
    Command::new(env!("CARGO_BIN_EXE_metamerge"))
}

const CONFIG: &str = r#"
name = "subjects"
root = "Subject"
source_priority = ["GDC", "PDC"]

[sources.GDC]
file = "gdc.jsonl"

[sources.PDC]
file = "pdc.jsonl"

[entities.Subject.audit]
distinct = ["sex"]
agreement = ["sex"]

[entities.Subject.fields.id]
merge_type = "coalesce"

[entities.Subject.fields.race]
merge_type = "coalesce"
default = "not reported"

[entities.Subject.fields.sex]
merge_type = "coalesce"

[entities.Subject.fields.specimens]
merge_type = "merge_nested_by_id"
entity = "Specimen"

[entities.Specimen.fields.id]
merge_type = "coalesce"

[entities.Specimen.fields.type]
merge_type = "coalesce"
"#;

const GDC: &str = r#"{"id": "P1", "race": "White", "specimens": [{"id": "S1", "type": "tumor"}]}
{"id": "P2", "sex": "female"}
"#;

const PDC: &str = r#"{"id": "P1", "race": null, "specimens": [{"id": "S1", "type": "tumor"}, {"id": "S2", "type": "normal"}]}
{"id": "P2", "sex": "male"}
"#;

/// Temp dir holding the config and both source files.
fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("subjects.recon.toml"), CONFIG).unwrap();
    std::fs::write(dir.path().join("gdc.jsonl"), GDC).unwrap();
    std::fs::write(dir.path().join("pdc.jsonl"), PDC).unwrap();
    dir
}

fn run_in(dir: &Path, args: &[&str]) -> Output {
    metamerge()
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn metamerge")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// ===========================================================================
// metamerge run
// ===========================================================================

#[test]
fn run_writes_merged_records_and_reports() {
    let dir = workspace();
    let output = run_in(
        dir.path(),
        &[
            "run",
            "subjects.recon.toml",
            "--output",
            "merged.jsonl",
            "--report",
            "report.json",
            "--conflicts-csv",
            "conflicts.csv",
        ],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("2 identities from 4 records"));

    let merged = std::fs::read_to_string(dir.path().join("merged.jsonl")).unwrap();
    let records: Vec<serde_json::Value> = merged
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0],
        serde_json::json!({
            "id": "P1",
            "race": "White",
            "sex": null,
            "specimens": [
                {"id": "S1", "type": "tumor"},
                {"id": "S2", "type": "normal"},
            ],
        })
    );
    assert_eq!(records[1]["sex"], "female");

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap())
            .unwrap();
    assert_eq!(report["conflicts"].as_array().unwrap().len(), 1);
    assert_eq!(report["conflicts"][0]["cached"], "female");
    assert_eq!(report["conflicts"][0]["observed"], "male");
    assert_eq!(report["distinct_values"]["sex"], serde_json::json!(["female", "male", null]));

    let csv = std::fs::read_to_string(dir.path().join("conflicts.csv")).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "kind,entity,identity,field,left_source,left_value,right_source,right_value");
    assert!(lines.contains(&"conflict,Subject,P2,sex,GDC,female,PDC,male"));
    assert!(lines.contains(&"resolution,Subject,P2,sex,GDC,female,PDC,male"));
}

#[test]
fn run_json_stdout_is_one_value() {
    let dir = workspace();
    let output = run_in(dir.path(), &["run", "subjects.recon.toml", "--json", "--workers", "2"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let val: serde_json::Value = serde_json::from_str(stdout.trim())
        .unwrap_or_else(|e| panic!("stdout must be one JSON value: {e}\n{stdout}"));
    assert_eq!(val["meta"]["config_name"], "subjects");
    assert_eq!(val["summary"]["identities"], 2);
    assert_eq!(val["summary"]["conflicts"], 1);
    assert_eq!(val["records"].as_array().unwrap().len(), 2);
}

#[test]
fn explicit_inputs_replace_config_sources() {
    let dir = workspace();
    let output = run_in(
        dir.path(),
        &["run", "subjects.recon.toml", "-i", "PDC=pdc.jsonl", "--json"],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let val: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(val["meta"]["sources"], serde_json::json!(["PDC"]));
    assert_eq!(val["summary"]["merged"], 0);
    assert_eq!(val["records"][1]["sex"], "male");
}

#[test]
fn show_report_prints_conflicts() {
    let dir = workspace();
    let output = run_in(dir.path(), &["run", "subjects.recon.toml", "--show-report"]);
    assert!(output.status.success());
    let err = stderr(&output);
    assert!(err.contains("Conflicts (1)"));
    assert!(err.contains("Subject P2 sex: GDC=female vs PDC=male"));
}

// ===========================================================================
// Exit codes
// ===========================================================================

#[test]
fn fail_on_conflict_exits_5() {
    let dir = workspace();
    let output = run_in(dir.path(), &["run", "subjects.recon.toml", "--fail-on-conflict"]);
    assert_eq!(output.status.code(), Some(5));
    assert!(stderr(&output).contains("error: 1 conflicts recorded"));
}

#[test]
fn invalid_config_exits_3_with_hint() {
    let dir = workspace();
    std::fs::write(
        dir.path().join("bad.recon.toml"),
        "name = \"bad\"\nroot = \"Subject\"\n[entities.Subject.fields.race]\nmerge_type = \"first_wins\"\n",
    )
    .unwrap();
    let output = run_in(dir.path(), &["run", "bad.recon.toml"]);
    assert_eq!(output.status.code(), Some(3));
    let err = stderr(&output);
    assert!(err.contains("error: config parse error"));
    assert!(err.contains("hint:  check the config with `metamerge validate <config>`"));
}

#[test]
fn missing_identity_exits_4() {
    let dir = workspace();
    std::fs::write(dir.path().join("pdc.jsonl"), "{\"race\": \"Asian\"}\n").unwrap();
    let output = run_in(dir.path(), &["run", "subjects.recon.toml"]);
    assert_eq!(output.status.code(), Some(4));
    assert!(stderr(&output).contains("has no identity field 'id'"));
}

#[test]
fn malformed_line_exits_4() {
    let dir = workspace();
    std::fs::write(dir.path().join("gdc.jsonl"), "{\"id\": \"P1\"}\nnot json\n").unwrap();
    let output = run_in(dir.path(), &["run", "subjects.recon.toml"]);
    assert_eq!(output.status.code(), Some(4));
    assert!(stderr(&output).contains("source 'GDC', line 2"));
}

#[test]
fn malformed_input_flag_exits_2() {
    let dir = workspace();
    let output = run_in(dir.path(), &["run", "subjects.recon.toml", "--input", "gdc.jsonl"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("expected SOURCE=PATH"));
}

#[test]
fn missing_input_file_exits_6() {
    let dir = workspace();
    std::fs::remove_file(dir.path().join("pdc.jsonl")).unwrap();
    let output = run_in(dir.path(), &["run", "subjects.recon.toml"]);
    assert_eq!(output.status.code(), Some(6));
    assert!(stderr(&output).contains("cannot read"));
}

// ===========================================================================
// metamerge validate
// ===========================================================================

#[test]
fn validate_reports_shape() {
    let dir = workspace();
    let output = run_in(dir.path(), &["validate", "subjects.recon.toml"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains(
        "valid: 'subjects' rooted at Subject with 2 entity type(s), 6 field(s), 2 source(s)"
    ));
}

#[test]
fn validate_rejects_dangling_reference() {
    let dir = workspace();
    let config = CONFIG.replace("entity = \"Specimen\"", "entity = \"Sample\"");
    std::fs::write(dir.path().join("dangling.recon.toml"), config).unwrap();
    let output = run_in(dir.path(), &["validate", "dangling.recon.toml"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("undefined entity 'Sample'"));
}
