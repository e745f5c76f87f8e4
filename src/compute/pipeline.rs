use crate::compute::frame::{Cell, Frame};
use crate::compute::ComputeError;
use crate::oracle::strip_code_fence;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeriveOp {
    Ratio,
    Diff,
    Sum,
    Product,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateSpec {
    pub agg: AggFn,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(rename = "as")]
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricSpec {
    pub name: String,
    pub agg: AggFn,
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotKind {
    Line,
    Bar,
}

impl std::fmt::Display for PlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlotKind::Line => write!(f, "line"),
            PlotKind::Bar => write!(f, "bar"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlotSpec {
    pub kind: PlotKind,
    pub x: String,
    pub y: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// The whitelisted operation set. Anything outside these ops fails
/// deserialization, which is how the computation surface stays closed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum PipelineStep {
    Filter {
        column: String,
        cmp: Comparator,
        value: serde_json::Value,
    },
    Derive {
        name: String,
        expr: DeriveOp,
        left: String,
        right: String,
    },
    GroupBy {
        keys: Vec<String>,
        aggregates: Vec<AggregateSpec>,
    },
    SortBy {
        column: String,
        #[serde(default)]
        descending: bool,
    },
    Head {
        n: usize,
    },
}

/// Declarative computation over one persisted artifact. `plot` is accepted as
/// shorthand for a one-element `plots` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    pub dataset: String,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub plot: Option<PlotSpec>,
    #[serde(default)]
    pub plots: Vec<PlotSpec>,
    #[serde(default)]
    pub result: Option<String>,
}

/// Parses oracle output into a pipeline. Accepts a bare pipeline object or an
/// envelope with a `pipeline` key, optionally fenced.
pub fn parse_pipeline(raw: &str) -> Result<Pipeline, ComputeError> {
    let cleaned = strip_code_fence(raw);
    let value: serde_json::Value = serde_json::from_str(cleaned)
        .map_err(|err| ComputeError::InvalidPipeline(format!("not valid json: {err}")))?;
    let payload = match value.get("pipeline") {
        Some(inner) => inner.clone(),
        None => value,
    };
    serde_json::from_value(payload)
        .map_err(|err| ComputeError::InvalidPipeline(err.to_string()))
}

impl Pipeline {
    pub fn all_plots(&self) -> Vec<&PlotSpec> {
        self.plot.iter().chain(self.plots.iter()).collect()
    }

    pub fn apply_steps(
        &self,
        mut frame: Frame,
        log: &mut Vec<String>,
    ) -> Result<Frame, ComputeError> {
        for step in &self.steps {
            frame = apply_step(frame, step, log)?;
        }
        Ok(frame)
    }

    pub fn compute_metrics(&self, frame: &Frame) -> Result<BTreeMap<String, f64>, ComputeError> {
        let mut metrics = BTreeMap::new();
        for spec in &self.metrics {
            let value = eval_aggregate(frame, spec.agg, spec.column.as_deref())?;
            metrics.insert(spec.name.clone(), value);
        }
        Ok(metrics)
    }
}

fn apply_step(
    frame: Frame,
    step: &PipelineStep,
    log: &mut Vec<String>,
) -> Result<Frame, ComputeError> {
    match step {
        PipelineStep::Filter { column, cmp, value } => {
            let idx = frame.column_index(column)?;
            let before = frame.row_count();
            let rows: Vec<Vec<Cell>> = frame
                .rows
                .into_iter()
                .filter(|row| row.get(idx).is_some_and(|cell| cell_matches(cell, *cmp, value)))
                .collect();
            let filtered = Frame::new(frame.columns, rows);
            log.push(format!(
                "filtered on `{column}`: {before} -> {} rows",
                filtered.row_count()
            ));
            Ok(filtered)
        }
        PipelineStep::Derive {
            name,
            expr,
            left,
            right,
        } => {
            let left_idx = frame.column_index(left)?;
            let right_idx = frame.column_index(right)?;
            let mut columns = frame.columns;
            columns.push(name.clone());
            let rows: Vec<Vec<Cell>> = frame
                .rows
                .into_iter()
                .map(|mut row| {
                    let lhs = row.get(left_idx).and_then(Cell::as_num);
                    let rhs = row.get(right_idx).and_then(Cell::as_num);
                    row.push(derive_cell(*expr, lhs, rhs));
                    row
                })
                .collect();
            log.push(format!("derived column `{name}` = {left} {expr:?} {right}"));
            Ok(Frame::new(columns, rows))
        }
        PipelineStep::GroupBy { keys, aggregates } => {
            let grouped = group_by(&frame, keys, aggregates)?;
            log.push(format!(
                "grouped by [{}] into {} rows",
                keys.join(", "),
                grouped.row_count()
            ));
            Ok(grouped)
        }
        PipelineStep::SortBy { column, descending } => {
            let idx = frame.column_index(column)?;
            let mut rows = frame.rows;
            rows.sort_by(|a, b| {
                let ordering = compare_cells(a.get(idx), b.get(idx));
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            log.push(format!(
                "sorted by `{column}` {}",
                if *descending { "descending" } else { "ascending" }
            ));
            Ok(Frame::new(frame.columns, rows))
        }
        PipelineStep::Head { n } => {
            let mut rows = frame.rows;
            rows.truncate(*n);
            log.push(format!("kept first {n} rows"));
            Ok(Frame::new(frame.columns, rows))
        }
    }
}

fn cell_matches(cell: &Cell, cmp: Comparator, value: &serde_json::Value) -> bool {
    match cmp {
        Comparator::Contains => {
            let needle = value.as_str().unwrap_or_default();
            !needle.is_empty() && cell.render().contains(needle)
        }
        _ => {
            let ordering = match (cell.as_num(), value.as_f64()) {
                (Some(lhs), Some(rhs)) => lhs.partial_cmp(&rhs),
                _ => Some(cell.render().as_str().cmp(value.as_str().unwrap_or_default())),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match cmp {
                Comparator::Eq => ordering == Ordering::Equal,
                Comparator::Ne => ordering != Ordering::Equal,
                Comparator::Lt => ordering == Ordering::Less,
                Comparator::Le => ordering != Ordering::Greater,
                Comparator::Gt => ordering == Ordering::Greater,
                Comparator::Ge => ordering != Ordering::Less,
                Comparator::Contains => false,
            }
        }
    }
}

fn derive_cell(op: DeriveOp, lhs: Option<f64>, rhs: Option<f64>) -> Cell {
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        return Cell::Null;
    };
    let value = match op {
        DeriveOp::Ratio => {
            if rhs == 0.0 {
                return Cell::Null;
            }
            lhs / rhs
        }
        DeriveOp::Diff => lhs - rhs,
        DeriveOp::Sum => lhs + rhs,
        DeriveOp::Product => lhs * rhs,
    };
    Cell::Num(value)
}

fn compare_cells(a: Option<&Cell>, b: Option<&Cell>) -> Ordering {
    match (a.and_then(Cell::as_num), b.and_then(Cell::as_num)) {
        (Some(lhs), Some(rhs)) => lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal),
        _ => a
            .map(Cell::render)
            .unwrap_or_default()
            .cmp(&b.map(Cell::render).unwrap_or_default()),
    }
}

fn group_by(
    frame: &Frame,
    keys: &[String],
    aggregates: &[AggregateSpec],
) -> Result<Frame, ComputeError> {
    let key_indices: Vec<usize> = keys
        .iter()
        .map(|key| frame.column_index(key))
        .collect::<Result<_, _>>()?;
    for spec in aggregates {
        if let Some(column) = spec.column.as_deref() {
            frame.column_index(column)?;
        }
    }

    let mut groups: BTreeMap<Vec<String>, Vec<&Vec<Cell>>> = BTreeMap::new();
    for row in &frame.rows {
        let key: Vec<String> = key_indices
            .iter()
            .map(|idx| row.get(*idx).map(Cell::render).unwrap_or_default())
            .collect();
        groups.entry(key).or_default().push(row);
    }

    let mut columns: Vec<String> = keys.to_vec();
    columns.extend(aggregates.iter().map(|spec| spec.alias.clone()));

    let mut rows = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut row: Vec<Cell> = key.into_iter().map(Cell::Text).collect();
        for spec in aggregates {
            let values: Vec<f64> = match spec.column.as_deref() {
                Some(column) => {
                    let idx = frame.column_index(column)?;
                    members
                        .iter()
                        .filter_map(|member| member.get(idx).and_then(Cell::as_num))
                        .collect()
                }
                None => Vec::new(),
            };
            row.push(match eval_agg_values(spec.agg, &values, members.len()) {
                Some(value) => Cell::Num(value),
                None => Cell::Null,
            });
        }
        rows.push(row);
    }

    Ok(Frame::new(columns, rows))
}

fn eval_agg_values(agg: AggFn, values: &[f64], member_count: usize) -> Option<f64> {
    match agg {
        AggFn::Count => Some(if values.is_empty() {
            member_count as f64
        } else {
            values.len() as f64
        }),
        AggFn::Sum => Some(values.iter().sum()),
        AggFn::Mean => {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        AggFn::Min => values.iter().copied().reduce(f64::min),
        AggFn::Max => values.iter().copied().reduce(f64::max),
    }
}

fn eval_aggregate(
    frame: &Frame,
    agg: AggFn,
    column: Option<&str>,
) -> Result<f64, ComputeError> {
    let values = match column {
        Some(column) => frame.numeric_column(column)?,
        None => Vec::new(),
    };
    if column.is_none() && agg == AggFn::Count {
        return Ok(frame.row_count() as f64);
    }
    let column_name = column.unwrap_or("<rows>").to_string();
    eval_agg_values(agg, &values, frame.row_count()).ok_or(ComputeError::EmptyAggregate {
        column: column_name,
    })
}
