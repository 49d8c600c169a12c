//! `metamerge run` and `metamerge validate`: config-driven entity merge.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Args;

use metamerge_recon::engine::{run_with, CancelToken, RunOptions};
use metamerge_recon::input::load_records;
use metamerge_recon::model::{ReconInput, ReconResult, SourceInput};
use metamerge_recon::ReconConfig;

use crate::exit_codes::{EXIT_CONFLICTS, EXIT_RUNTIME, EXIT_USAGE};
use crate::CliError;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the .recon.toml merge config
    pub config: PathBuf,

    /// Input stream as SOURCE=PATH (repeatable). Defaults to the config's [sources]
    #[arg(long = "input", short = 'i', value_name = "SOURCE=PATH")]
    pub inputs: Vec<String>,

    /// Write merged records as JSON Lines
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Write the conflict report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Write conflicts and coalesce resolutions as CSV
    #[arg(long, value_name = "PATH")]
    pub conflicts_csv: Option<PathBuf>,

    /// Print the full result as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Print the conflict report to stderr after the summary
    #[arg(long)]
    pub show_report: bool,

    /// Merge identities on N worker threads
    #[arg(long, default_value_t = 1, env = "METAMERGE_WORKERS")]
    pub workers: usize,

    /// Exit with code 5 when any conflict was recorded
    #[arg(long)]
    pub fail_on_conflict: bool,
}

fn runtime_err(msg: impl Into<String>) -> CliError {
    CliError::new(EXIT_RUNTIME, msg)
}

fn read_config(path: &Path) -> Result<ReconConfig, CliError> {
    let config_str = std::fs::read_to_string(path)
        .map_err(|e| runtime_err(format!("cannot read config {}: {e}", path.display())))?;
    Ok(ReconConfig::from_toml(&config_str)?)
}

/// `(source, path)` pairs from `--input` flags, or from the config's
/// `[sources]` table with paths relative to the config file.
fn resolve_inputs(
    args: &RunArgs,
    config: &ReconConfig,
) -> Result<Vec<(String, PathBuf)>, CliError> {
    if !args.inputs.is_empty() {
        return args
            .inputs
            .iter()
            .map(|spec| match spec.split_once('=') {
                Some((source, path)) if !source.is_empty() && !path.is_empty() => {
                    Ok((source.to_string(), PathBuf::from(path)))
                }
                _ => Err(CliError::new(EXIT_USAGE, format!("invalid --input '{spec}'"))
                    .with_hint("expected SOURCE=PATH, e.g. --input GDC=gdc.jsonl")),
            })
            .collect();
    }

    let base_dir = args.config.parent().unwrap_or_else(|| Path::new("."));
    if config.sources.is_empty() {
        return Err(CliError::new(EXIT_USAGE, "no input streams")
            .with_hint("pass --input SOURCE=PATH or add a [sources.NAME] table to the config"));
    }
    Ok(config
        .sources
        .iter()
        .map(|(source, sc)| (source.clone(), base_dir.join(&sc.file)))
        .collect())
}

fn load_input(config: &ReconConfig, inputs: &[(String, PathBuf)]) -> Result<ReconInput, CliError> {
    let mut sources = Vec::with_capacity(inputs.len());
    for (source, path) in inputs {
        let data = std::fs::read_to_string(path)
            .map_err(|e| runtime_err(format!("cannot read {}: {e}", path.display())))?;
        let records = load_records(source, &data, config)?;
        log::debug!("{source}: {} records from {}", records.len(), path.display());
        sources.push(SourceInput {
            source: source.clone(),
            records,
        });
    }
    Ok(ReconInput { sources })
}

/// Ctrl-C flips the token; the engine stops before the next identity.
fn install_interrupt_handler() -> CancelToken {
    let token: CancelToken = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&token);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping after the current identity...");
        flag.store(true, Ordering::Relaxed);
    }) {
        log::warn!("cannot install interrupt handler: {e}");
    }
    token
}

pub fn cmd_run(args: RunArgs) -> Result<(), CliError> {
    let config = read_config(&args.config)?;
    let inputs = resolve_inputs(&args, &config)?;
    let input = load_input(&config, &inputs)?;

    let options = RunOptions {
        workers: args.workers.max(1),
        cancel: Some(install_interrupt_handler()),
    };
    let result = run_with(&config, &input, &options)?;

    write_outputs(&args, &result)?;

    // Human summary to stderr
    let s = &result.summary;
    eprintln!(
        "{}: {} identities from {} records — {} merged, {} passed through, {} conflicts, {} resolutions",
        result.meta.config_name,
        s.identities,
        s.input_records,
        s.merged,
        s.passed_through,
        s.conflicts,
        s.resolutions,
    );

    if args.show_report {
        let mut stderr = std::io::stderr().lock();
        result
            .report
            .write_text(&mut stderr)
            .map_err(|e| runtime_err(format!("cannot write report: {e}")))?;
    }

    if args.fail_on_conflict && !result.report.is_clean() {
        return Err(CliError::new(
            EXIT_CONFLICTS,
            format!("{} conflicts recorded", s.conflicts),
        )
        .with_hint("inspect them with --report, --conflicts-csv or --show-report"));
    }
    Ok(())
}

fn write_outputs(args: &RunArgs, result: &ReconResult) -> Result<(), CliError> {
    if let Some(ref path) = args.output {
        let file = File::create(path)
            .map_err(|e| runtime_err(format!("cannot write {}: {e}", path.display())))?;
        let mut out = BufWriter::new(file);
        for record in &result.records {
            serde_json::to_writer(&mut out, record)
                .map_err(|e| runtime_err(format!("JSON serialization error: {e}")))?;
            out.write_all(b"\n")
                .map_err(|e| runtime_err(format!("cannot write {}: {e}", path.display())))?;
        }
        out.flush()
            .map_err(|e| runtime_err(format!("cannot write {}: {e}", path.display())))?;
        eprintln!("wrote {} ({} records)", path.display(), result.records.len());
    }

    if let Some(ref path) = args.report {
        let json_str = serde_json::to_string_pretty(&result.report)
            .map_err(|e| runtime_err(format!("JSON serialization error: {e}")))?;
        std::fs::write(path, json_str)
            .map_err(|e| runtime_err(format!("cannot write {}: {e}", path.display())))?;
        eprintln!("wrote {}", path.display());
    }

    if let Some(ref path) = args.conflicts_csv {
        let file = File::create(path)
            .map_err(|e| runtime_err(format!("cannot write {}: {e}", path.display())))?;
        result.report.write_conflicts_csv(BufWriter::new(file))?;
        eprintln!("wrote {}", path.display());
    }

    if args.json {
        let json_str = serde_json::to_string_pretty(result)
            .map_err(|e| runtime_err(format!("JSON serialization error: {e}")))?;
        println!("{json_str}");
    }
    Ok(())
}

pub fn cmd_validate(config_path: PathBuf) -> Result<(), CliError> {
    let config = read_config(&config_path)?;
    let fields: usize = config.entities.values().map(|e| e.fields.len()).sum();
    eprintln!(
        "valid: '{}' rooted at {} with {} entity type(s), {} field(s), {} source(s)",
        config.name,
        config.root,
        config.entities.len(),
        fields,
        config.sources.len(),
    );
    Ok(())
}
