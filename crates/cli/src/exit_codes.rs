//! CLI Exit Code Registry
//!
//! This is the single source of truth for all `metamerge` exit codes.
//! Exit codes are part of the shell contract; pipelines branch on them.
//!
//! | Code | Meaning                                              |
//! |------|------------------------------------------------------|
//! | 0    | Success                                              |
//! | 1    | General error (unspecified)                          |
//! | 2    | Usage error (bad arguments, malformed `--input`)     |
//! | 3    | Invalid merge config                                 |
//! | 4    | Input error (malformed record, missing identity)     |
//! | 5    | Conflicts recorded and `--fail-on-conflict` was set  |
//! | 6    | Runtime I/O failure (cannot read or write a file)    |
//! | 130  | Interrupted (Ctrl-C cancelled the run)               |

use metamerge_recon::ReconError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
pub const EXIT_USAGE: u8 = 2;

/// Config failed to parse or validate.
pub const EXIT_INVALID_CONFIG: u8 = 3;

/// Input record could not be loaded or grouped.
pub const EXIT_INPUT: u8 = 4;

/// Run completed, but the conflict log is not clean.
pub const EXIT_CONFLICTS: u8 = 5;

/// Reading inputs or writing outputs failed.
pub const EXIT_RUNTIME: u8 = 6;

/// Cancelled by SIGINT.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Map an engine error to its exit code.
pub fn recon_exit_code(err: &ReconError) -> u8 {
    match err {
        ReconError::ConfigParse(_)
        | ReconError::ConfigValidation(_)
        | ReconError::UnknownEntity(_) => EXIT_INVALID_CONFIG,
        ReconError::MissingIdentity { .. }
        | ReconError::InvalidValue { .. }
        | ReconError::InputParse { .. } => EXIT_INPUT,
        ReconError::Cancelled { .. } => EXIT_INTERRUPTED,
        ReconError::Io(_) => EXIT_RUNTIME,
        ReconError::WorkerPool(_) => EXIT_ERROR,
    }
}
