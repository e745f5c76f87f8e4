use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub mod frame;
pub mod pipeline;
pub mod plot;

pub use frame::{Cell, Frame};
pub use pipeline::{parse_pipeline, Pipeline};

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
    #[error("unknown dataset `{name}`; available: {available}")]
    UnknownDataset { name: String, available: String },
    #[error("column `{column}` not found in dataset")]
    MissingColumn { column: String },
    #[error("column `{column}` holds no numeric values")]
    NonNumericColumn { column: String },
    #[error("aggregate over empty input for column `{column}`")]
    EmptyAggregate { column: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv read failed at {path}: {source}")]
    CsvRead {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("plot rendering failed: {0}")]
    Plot(String),
}

impl ComputeError {
    pub fn is_validation(&self) -> bool {
        matches!(self, ComputeError::InvalidPipeline(_))
    }
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> ComputeError {
    ComputeError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// What one pipeline run hands back to the loop. Metrics default to empty and
/// plots to an empty list when the pipeline declares none.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeOutcome {
    pub summary_text: String,
    pub metrics: BTreeMap<String, f64>,
    pub plot_paths: Vec<String>,
}

/// Runs a declarative pipeline against previously persisted artifacts. The
/// only filesystem writes are plot files under `cache_dir`; input artifacts
/// are read-only. Every failure is returned as a value for the caller to
/// record as a step error.
pub fn run_pipeline(
    pipeline: &Pipeline,
    datasets: &BTreeMap<String, String>,
    cache_dir: &Path,
) -> Result<ComputeOutcome, ComputeError> {
    let csv_path = datasets
        .get(&pipeline.dataset)
        .ok_or_else(|| ComputeError::UnknownDataset {
            name: pipeline.dataset.clone(),
            available: datasets.keys().cloned().collect::<Vec<_>>().join(", "),
        })?;
    let frame = Frame::from_csv_path(Path::new(csv_path))?;

    let mut log = vec![format!(
        "loaded dataset `{}` ({} rows, {} columns)",
        pipeline.dataset,
        frame.row_count(),
        frame.columns.len()
    )];

    let frame = pipeline.apply_steps(frame, &mut log)?;
    let metrics = pipeline.compute_metrics(&frame)?;

    let mut plot_paths: Vec<String> = Vec::new();
    for spec in pipeline.all_plots() {
        let path: PathBuf = plot::render_plot(spec, &frame, cache_dir)?;
        log.push(format!("saved {} plot to {}", spec.kind, path.display()));
        plot_paths.push(path.display().to_string());
    }

    let mut summary_parts = log;
    if let Some(result) = pipeline.result.as_ref() {
        if !result.trim().is_empty() {
            summary_parts.push(result.trim().to_string());
        }
    }

    Ok(ComputeOutcome {
        summary_text: summary_parts.join("\n"),
        metrics,
        plot_paths,
    })
}
