use crate::session::{ColumnSchema, DatabaseSchema, TableSchema};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("schema introspection failed: {source}")]
    Introspection {
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to read knowledge file {path}: {source}")]
    ReadDoc {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Introspects the managed database and returns its table layout. A missing
/// database file yields an empty schema rather than an error, matching a
/// fresh deployment with no data yet.
pub fn load_database_schema(db_path: &Path) -> Result<DatabaseSchema, ContextError> {
    if !db_path.exists() {
        return Ok(DatabaseSchema::default());
    }

    let connection = Connection::open(db_path).map_err(|source| ContextError::Open {
        path: db_path.display().to_string(),
        source,
    })?;

    let mut table_stmt = connection
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
        .map_err(|source| ContextError::Introspection { source })?;
    let table_names: Vec<String> = table_stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|source| ContextError::Introspection { source })?
        .collect::<Result<_, _>>()
        .map_err(|source| ContextError::Introspection { source })?;

    let mut tables = Vec::with_capacity(table_names.len());
    for name in table_names {
        let mut column_stmt = connection
            .prepare(&format!("PRAGMA table_info('{name}')"))
            .map_err(|source| ContextError::Introspection { source })?;
        let columns: Vec<ColumnSchema> = column_stmt
            .query_map([], |row| {
                Ok(ColumnSchema {
                    name: row.get::<_, String>("name")?,
                    data_type: row.get::<_, Option<String>>("type")?.unwrap_or_default(),
                    not_null: row.get::<_, i64>("notnull")? != 0,
                    primary_key: row.get::<_, i64>("pk")? != 0,
                    default_value: row.get::<_, Option<String>>("dflt_value")?,
                })
            })
            .map_err(|source| ContextError::Introspection { source })?
            .collect::<Result<_, _>>()
            .map_err(|source| ContextError::Introspection { source })?;
        tables.push(TableSchema { name, columns });
    }

    Ok(DatabaseSchema { tables })
}

/// Loads every Markdown file under `docs_path` (sorted by file name) and
/// builds a table index from `## Table: <name>` headings. Returns the
/// concatenated knowledge text plus the index.
pub fn load_markdown_knowledge(
    docs_path: &Path,
) -> Result<(String, BTreeMap<String, String>), ContextError> {
    let mut contents: Vec<String> = Vec::new();
    let mut table_index = BTreeMap::new();

    let mut md_paths: Vec<_> = match fs::read_dir(docs_path) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
            .collect(),
        Err(_) => Vec::new(),
    };
    md_paths.sort();

    for path in md_paths {
        let text = fs::read_to_string(&path).map_err(|source| ContextError::ReadDoc {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        contents.push(format!("# File: {file_name}\n{text}"));

        for (offset, line) in line_offsets(&text) {
            if let Some(rest) = line.strip_prefix("## Table:") {
                let table_name = rest.trim().to_string();
                if !table_name.is_empty() {
                    table_index.insert(table_name, extract_table_section(&text, offset));
                }
            }
        }
    }

    Ok((contents.join("\n\n"), table_index))
}

fn line_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.lines().map(move |line| {
        let current = offset;
        offset += line.len() + 1;
        (current, line)
    })
}

/// Captures section text from a heading until the next heading of any level.
fn extract_table_section(text: &str, heading_offset: usize) -> String {
    let rest = &text[heading_offset..];
    let mut captured: Vec<&str> = Vec::new();
    for line in rest.lines().skip(1) {
        if line.starts_with('#') {
            break;
        }
        captured.push(line);
    }
    captured.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_database_yields_empty_schema() {
        let dir = tempdir().expect("tempdir");
        let schema = load_database_schema(&dir.path().join("missing.sqlite")).expect("load");
        assert!(schema.tables.is_empty());
    }

    #[test]
    fn schema_introspection_captures_columns_and_flags() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("fab.sqlite");
        let connection = Connection::open(&db_path).expect("open");
        connection
            .execute_batch(
                "CREATE TABLE defects_daily (
                    id INTEGER PRIMARY KEY,
                    tool TEXT NOT NULL,
                    recipe TEXT NOT NULL,
                    pre_defectwise_count INTEGER DEFAULT 0
                );
                CREATE TABLE calibrations (tool TEXT, cal_name TEXT);",
            )
            .expect("create tables");
        drop(connection);

        let schema = load_database_schema(&db_path).expect("load");
        assert_eq!(schema.table_names(), vec!["calibrations", "defects_daily"]);

        let defects = &schema.tables[1];
        assert_eq!(defects.columns.len(), 4);
        let id_col = &defects.columns[0];
        assert!(id_col.primary_key);
        let tool_col = &defects.columns[1];
        assert!(tool_col.not_null);
        assert!(!tool_col.primary_key);
        let count_col = &defects.columns[3];
        assert_eq!(count_col.default_value.as_deref(), Some("0"));
    }

    #[test]
    fn missing_docs_directory_yields_empty_knowledge() {
        let dir = tempdir().expect("tempdir");
        let (knowledge, index) =
            load_markdown_knowledge(&dir.path().join("nowhere")).expect("load");
        assert!(knowledge.is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn table_headings_index_their_sections() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("rules.md"),
            "# Drift rules\n\n## Table: defects_daily\nDaily pre-inspection defect counts.\nUsed for weekly drift labels.\n\n## Table: wc_points\nWafer-center positions.\n",
        )
        .expect("write doc");

        let (knowledge, index) = load_markdown_knowledge(dir.path()).expect("load");
        assert!(knowledge.starts_with("# File: rules.md"));
        assert_eq!(index.len(), 2);
        let defects = index.get("defects_daily").expect("defects entry");
        assert!(defects.contains("weekly drift labels"));
        assert!(!defects.contains("Wafer-center"));
        assert_eq!(index.get("wc_points").map(String::as_str), Some("Wafer-center positions."));
    }

    #[test]
    fn docs_concatenate_in_file_name_order() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("b_tools.md"), "tool notes").expect("write");
        std::fs::write(dir.path().join("a_intro.md"), "intro notes").expect("write");
        std::fs::write(dir.path().join("ignore.txt"), "not markdown").expect("write");

        let (knowledge, _) = load_markdown_knowledge(dir.path()).expect("load");
        let intro_at = knowledge.find("intro notes").expect("intro present");
        let tools_at = knowledge.find("tool notes").expect("tools present");
        assert!(intro_at < tools_at);
        assert!(!knowledge.contains("not markdown"));
    }
}
