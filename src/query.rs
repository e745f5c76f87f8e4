use crate::oracle::strip_code_fence;
use crate::session::DataArtifact;
use crate::shared::new_artifact_id;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub mod templates;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("disallowed statement: only SELECT/WITH queries are permitted")]
    Disallowed,
    #[error("sqlite execution failed: {source}")]
    Sqlite {
        #[source]
        source: rusqlite::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv write failed at {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("artifact id generation failed: {0}")]
    ArtifactId(String),
}

impl QueryError {
    /// Validation failures are rejected before any I/O; everything else is an
    /// execution fault observed while running an accepted statement.
    pub fn is_validation(&self) -> bool {
        matches!(self, QueryError::Disallowed)
    }
}

fn sqlite_error(source: rusqlite::Error) -> QueryError {
    QueryError::Sqlite { source }
}

fn io_error(path: &Path, source: std::io::Error) -> QueryError {
    QueryError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Result summary handed back to the loop; the full result set lives in the
/// artifact file.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySummary {
    pub artifact_id: String,
    pub csv_path: PathBuf,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub sample_preview: Vec<BTreeMap<String, serde_json::Value>>,
}

impl QuerySummary {
    pub fn to_artifact(&self) -> DataArtifact {
        DataArtifact {
            artifact_id: self.artifact_id.clone(),
            csv_path: self.csv_path.display().to_string(),
            row_count: self.row_count,
            columns: self.columns.clone(),
            sample_preview: self.sample_preview.clone(),
        }
    }
}

/// Strips markdown fences and full-line `--` comments so validation sees the
/// statement itself.
pub fn normalize_sql(sql: &str) -> String {
    let unfenced = strip_code_fence(sql);
    unfenced
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Accepts only read-only query forms (SELECT or WITH-prefixed CTEs).
pub fn is_read_only_sql(sql: &str) -> bool {
    let lowered = normalize_sql(sql).to_lowercase();
    lowered.starts_with("select") || lowered.starts_with("with")
}

fn contains_limit_keyword(sql: &str) -> bool {
    let lowered = sql.to_lowercase();
    lowered
        .split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
        .any(|token| token == "limit")
}

/// Appends a LIMIT clause when the statement has none, so unbounded queries
/// still produce bounded artifacts.
pub fn ensure_limit(sql: &str, max_rows: usize) -> String {
    if contains_limit_keyword(sql) {
        return sql.to_string();
    }
    let trimmed = sql.trim_end().trim_end_matches(';');
    format!("{trimmed} LIMIT {max_rows};")
}

fn cell_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(v) => serde_json::Value::from(v),
        ValueRef::Real(v) => serde_json::Value::from(v),
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<{} bytes>", bytes.len())),
    }
}

fn cell_to_csv_field(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Validates, bounds, and runs a read-only query, persisting the full result
/// set as a new CSV artifact under `cache_dir`.
///
/// Validation failures return before any database or file I/O. SQLite-level
/// failures (bad column, type mismatch) surface as `QueryError::Sqlite`; the
/// caller records them as step errors and the loop re-plans.
pub fn execute_query(
    db_path: &Path,
    sql: &str,
    cache_dir: &Path,
    max_rows: usize,
) -> Result<QuerySummary, QueryError> {
    let cleaned = normalize_sql(sql);
    if !is_read_only_sql(&cleaned) {
        return Err(QueryError::Disallowed);
    }

    fs::create_dir_all(cache_dir).map_err(|source| io_error(cache_dir, source))?;
    let bounded = ensure_limit(&cleaned, max_rows);

    let connection = Connection::open(db_path).map_err(sqlite_error)?;
    let mut statement = connection.prepare(&bounded).map_err(sqlite_error)?;
    let columns: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();

    let mut rows = statement.query([]).map_err(sqlite_error)?;
    let mut collected: Vec<Vec<serde_json::Value>> = Vec::new();
    while let Some(row) = rows.next().map_err(sqlite_error)? {
        let mut record = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            let cell = row.get_ref(idx).map_err(sqlite_error)?;
            record.push(cell_to_json(cell));
        }
        collected.push(record);
    }

    let artifact_id = new_artifact_id().map_err(QueryError::ArtifactId)?;
    let csv_path = cache_dir.join(format!("{artifact_id}.csv"));
    let mut writer = csv::Writer::from_path(&csv_path).map_err(|source| QueryError::Csv {
        path: csv_path.display().to_string(),
        source,
    })?;
    writer
        .write_record(&columns)
        .and_then(|_| {
            for record in &collected {
                let fields: Vec<String> = record.iter().map(cell_to_csv_field).collect();
                writer.write_record(&fields)?;
            }
            writer.flush().map_err(csv::Error::from)
        })
        .map_err(|source| QueryError::Csv {
            path: csv_path.display().to_string(),
            source,
        })?;

    let sample_preview = collected
        .iter()
        .take(5)
        .map(|record| {
            columns
                .iter()
                .cloned()
                .zip(record.iter().cloned())
                .collect::<BTreeMap<_, _>>()
        })
        .collect();

    Ok(QuerySummary {
        artifact_id,
        csv_path,
        row_count: collected.len(),
        columns,
        sample_preview,
    })
}
