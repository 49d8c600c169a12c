// metamerge CLI - reconcile entity records from several sources

mod exit_codes;
mod recon;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

use exit_codes::{recon_exit_code, EXIT_SUCCESS};
use metamerge_recon::ReconError;

#[derive(Parser)]
#[command(name = "metamerge")]
#[command(about = "Merge per-source entity records into one canonical record per identity")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge the input streams named by a TOML config
    #[command(after_help = "\
Examples:
  metamerge run subjects.recon.toml
  metamerge run subjects.recon.toml --output merged.jsonl --report conflicts.json
  metamerge run subjects.recon.toml -i GDC=gdc.jsonl -i PDC=pdc.jsonl --json
  metamerge run subjects.recon.toml --workers 8 --fail-on-conflict")]
    Run(recon::RunArgs),

    /// Validate a merge config without running
    #[command(after_help = "\
Examples:
  metamerge validate subjects.recon.toml")]
    Validate {
        /// Path to the .recon.toml merge config
        config: PathBuf,
    },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("GIT_COMMIT_HASH"),
        ")",
        "\nengine:  metamerge-recon ",
        env!("CARGO_PKG_VERSION"),
        "\ntarget:  ",
        env!("TARGET"),
    )
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<ReconError> for CliError {
    fn from(err: ReconError) -> Self {
        let hint = match &err {
            e if e.is_config_error() => Some("check the config with `metamerge validate <config>`"),
            ReconError::MissingIdentity { .. } => {
                Some("every record, nested ones included, must carry its identity field")
            }
            ReconError::InputParse { .. } => Some("inputs are JSON Lines or a single JSON array"),
            _ => None,
        };
        Self {
            code: recon_exit_code(&err),
            message: err.to_string(),
            hint: hint.map(String::from),
        }
    }
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => recon::cmd_run(args),
        Commands::Validate { config } => recon::cmd_validate(config),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}
