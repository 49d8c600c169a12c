//! `metamerge-recon`: Policy-driven entity reconciliation engine.
//!
//! Pure engine crate: receives parsed records from several sources, returns
//! one canonical record per identity plus a conflict report.
//! No CLI or filesystem dependencies.

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod executor;
pub mod input;
pub mod model;
pub mod nested;
pub mod policy;

pub use config::{EntitySpec, FieldSpec, MergePolicy, ReconConfig};
pub use conflict::{ConflictLog, ConflictReport};
pub use engine::{run, run_with, CancelToken, RunOptions};
pub use error::ReconError;
pub use input::load_records;
pub use model::{EntityRecord, ReconInput, ReconResult, SourceInput, Value};
