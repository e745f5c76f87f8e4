use crate::compute::ComputeError;
use std::path::Path;

/// One table cell. CSV artifacts are untyped; numbers are recognized on load
/// and everything else stays text.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Num(f64),
    Text(String),
}

impl Cell {
    pub fn parse(field: &str) -> Self {
        if field.is_empty() {
            return Cell::Null;
        }
        match field.parse::<f64>() {
            Ok(value) => Cell::Num(value),
            Err(_) => Cell::Text(field.to_string()),
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Cell::Num(value) => Some(*value),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Num(value) => {
                if value.fract() == 0.0 && value.abs() < 1e15 {
                    format!("{}", *value as i64)
                } else {
                    format!("{value}")
                }
            }
            Cell::Text(text) => text.clone(),
        }
    }
}

/// Small in-memory table loaded from an artifact CSV. Row-major; columns are
/// addressed by header name.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Frame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, ComputeError> {
        let mut reader =
            csv::Reader::from_path(path).map_err(|source| ComputeError::CsvRead {
                path: path.display().to_string(),
                source,
            })?;
        let columns: Vec<String> = reader
            .headers()
            .map_err(|source| ComputeError::CsvRead {
                path: path.display().to_string(),
                source,
            })?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|source| ComputeError::CsvRead {
                path: path.display().to_string(),
                source,
            })?;
            rows.push(record.iter().map(Cell::parse).collect());
        }
        Ok(Self { columns, rows })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, ComputeError> {
        self.columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| ComputeError::MissingColumn {
                column: name.to_string(),
            })
    }

    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>, ComputeError> {
        let idx = self.column_index(name)?;
        let values: Vec<f64> = self
            .rows
            .iter()
            .filter_map(|row| row.get(idx).and_then(Cell::as_num))
            .collect();
        if values.is_empty() && !self.rows.is_empty() {
            return Err(ComputeError::NonNumericColumn {
                column: name.to_string(),
            });
        }
        Ok(values)
    }

    pub fn text_column(&self, name: &str) -> Result<Vec<String>, ComputeError> {
        let idx = self.column_index(name)?;
        Ok(self
            .rows
            .iter()
            .map(|row| row.get(idx).map(Cell::render).unwrap_or_default())
            .collect())
    }
}
