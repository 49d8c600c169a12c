use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::config::{EntitySpec, ReconConfig};
use crate::conflict::ConflictLog;
use crate::error::ReconError;
use crate::executor::{reconcile, MergeContext};
use crate::model::{
    EntityRecord, ReconInput, ReconMeta, ReconResult, ReconSummary, SourceCluster, Value,
};

/// Cooperative cancellation flag, checked once per identity.
pub type CancelToken = Arc<AtomicBool>;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Merge on a dedicated pool of this many threads when above 1.
    pub workers: usize,
    pub cancel: Option<CancelToken>,
}

/// Reconcile every input stream per config, single-threaded.
pub fn run(config: &ReconConfig, input: &ReconInput) -> Result<ReconResult, ReconError> {
    run_with(config, input, &RunOptions::default())
}

pub fn run_with(
    config: &ReconConfig,
    input: &ReconInput,
    options: &RunOptions,
) -> Result<ReconResult, ReconError> {
    config.validate()?;
    let root = config.root_spec()?;

    let input_records: usize = input.sources.iter().map(|s| s.records.len()).sum();
    log::info!(
        "reconciling {input_records} {} records from {} source streams",
        root.name,
        input.sources.len()
    );

    let clusters = group_by_identity(root, input)?;
    let clusters: Vec<&SourceCluster<'_>> = clusters.values().collect();
    let total = clusters.len();

    let log = ConflictLog::new();
    let ctx = MergeContext::new(config, &log);
    let processed = AtomicUsize::new(0);

    let merge_one = |cluster: &SourceCluster<'_>| -> Result<EntityRecord, ReconError> {
        if let Some(cancel) = &options.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(ReconError::Cancelled {
                    processed: processed.load(Ordering::Relaxed),
                    total,
                });
            }
        }
        let record = reconcile(root, cluster, &config.source_priority, ctx)?;
        processed.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    };

    // Both paths collect in identity order.
    let records = if options.workers > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|i| format!("recon-merge-{i}"))
            .build()
            .map_err(|e| ReconError::WorkerPool(e.to_string()))?;
        pool.install(|| {
            clusters
                .par_iter()
                .map(|cluster| merge_one(*cluster))
                .collect::<Result<Vec<_>, _>>()
        })?
    } else {
        clusters
            .iter()
            .map(|cluster| merge_one(*cluster))
            .collect::<Result<Vec<_>, _>>()?
    };

    let merged = clusters.iter().filter(|c| c.len() > 1).count();
    let report = log.into_report();
    let summary = ReconSummary {
        input_records,
        identities: total,
        merged,
        passed_through: total - merged,
        conflicts: report.conflicts.len(),
        resolutions: report.resolutions.len(),
    };
    log::info!(
        "{} identities ({} merged, {} passed through), {} conflicts, {} resolutions",
        summary.identities,
        summary.merged,
        summary.passed_through,
        summary.conflicts,
        summary.resolutions
    );

    let mut sources: Vec<String> = Vec::new();
    for s in &input.sources {
        if !sources.contains(&s.source) {
            sources.push(s.source.clone());
        }
    }

    Ok(ReconResult {
        meta: ReconMeta {
            config_name: config.name.clone(),
            root_entity: config.root.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
            source_priority: config.source_priority.clone(),
            sources,
        },
        summary,
        records,
        report,
    })
}

/// Key every top-level record by identity. A record without one aborts.
fn group_by_identity<'a>(
    root: &EntitySpec,
    input: &'a ReconInput,
) -> Result<BTreeMap<Value, SourceCluster<'a>>, ReconError> {
    let mut clusters: BTreeMap<Value, SourceCluster<'a>> = BTreeMap::new();
    for stream in &input.sources {
        for (i, record) in stream.records.iter().enumerate() {
            let identity =
                record
                    .present(&root.identity)
                    .ok_or_else(|| ReconError::MissingIdentity {
                        entity: root.name.clone(),
                        source_tag: stream.source.clone(),
                        field: root.identity.clone(),
                        context: format!("record {} of the stream", i + 1),
                    })?;
            clusters
                .entry(identity.clone())
                .or_insert_with(|| SourceCluster::new(identity.clone()))
                .insert(&stream.source, record);
        }
    }
    Ok(clusters)
}
