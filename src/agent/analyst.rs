use crate::agent::prompts::{PIPELINE_ANALYST_PROMPT, SQL_ANALYST_PROMPT};
use crate::agent::supervisor::resolve_tool_id;
use crate::config::AgentConfig;
use crate::oracle::{strip_code_fence, ChatMessage, Oracle};
use crate::query::templates::{
    is_deterministic_analysis, parse_analysis_date, sanitize_tool, sql_calibration_overdue,
    sql_defect_drift_weekly, sql_defect_trend_range, sql_stage_wc_weekly,
};
use crate::query::{execute_query, QueryError};
use crate::session::{Action, SessionState, StepKind, StepResult};
use crate::shared::append_agent_log_line;
use serde_json::json;

const SQL_ERROR_EXCERPT_CHARS: usize = 500;

/// Pulls SQL out of analyst oracle output: a JSON `{sql, reasoning}` object,
/// a fenced ```sql block, or the raw text as a last resort.
pub fn extract_sql(raw: &str) -> (String, String) {
    let cleaned = strip_code_fence(raw);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(cleaned) {
        if let Some(sql) = value.get("sql").and_then(|v| v.as_str()) {
            let reasoning = value
                .get("reasoning")
                .and_then(|v| v.as_str())
                .unwrap_or("SQL generated from the schema.")
                .to_string();
            return (sql.to_string(), reasoning);
        }
    }
    if let Some(start) = raw.find("```sql") {
        let body = &raw[start + "```sql".len()..];
        if let Some(end) = body.find("```") {
            return (
                body[..end].trim().to_string(),
                "SQL generated from the schema.".to_string(),
            );
        }
    }
    (
        cleaned.to_string(),
        "SQL generated from the schema.".to_string(),
    )
}

fn extract_rationale(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(strip_code_fence(raw))
        .ok()
        .and_then(|value| {
            value
                .get("rationale")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "Computation pipeline generated.".to_string())
}

fn step_id_or(action: &Action, fallback: &str) -> String {
    if action.id().is_empty() {
        fallback.to_string()
    } else {
        action.id().to_string()
    }
}

fn deterministic_sql(
    action_id: &str,
    action: &Action,
    state: &SessionState,
    config: &AgentConfig,
) -> Result<(String, String), String> {
    let requested_tool = match action {
        Action::QueryAnalysis { tool, .. } => tool.clone(),
        _ => None,
    };
    let tool = requested_tool
        .as_deref()
        .and_then(|raw| sanitize_tool(raw, &config.tool_ids))
        .or_else(|| resolve_tool_id(state, &config.tool_ids))
        .ok_or_else(|| format!("Tool must be one of: {}", config.tool_ids.join(", ")))?;

    match action_id {
        "defect_drift_weekly" => Ok((
            sql_defect_drift_weekly(&tool),
            "Computed weekly defect sums and drift labels per the documented rules.".to_string(),
        )),
        "calibration_overdue" => Ok((
            sql_calibration_overdue(&tool),
            "Checked calibration due dates (supporting evidence only).".to_string(),
        )),
        "stage_wc_weekly" => Ok((
            sql_stage_wc_weekly(&tool),
            "Summarized wafer-center abnormal ratio for this week.".to_string(),
        )),
        "defect_trend_range" => {
            let (raw_from, raw_to) = match action {
                Action::QueryAnalysis {
                    date_from, date_to, ..
                } => (date_from.clone(), date_to.clone()),
                _ => (None, None),
            };
            let from = raw_from
                .as_deref()
                .and_then(parse_analysis_date)
                .ok_or("Invalid date range format; expected YYYY-MM-DD.")?;
            let to = raw_to
                .as_deref()
                .and_then(parse_analysis_date)
                .ok_or("Invalid date range format; expected YYYY-MM-DD.")?;
            Ok((
                sql_defect_trend_range(&tool, from, to),
                "Fetched daily defect totals for the requested range.".to_string(),
            ))
        }
        other => Err(format!("unknown deterministic analysis `{other}`")),
    }
}

fn oracle_sql(
    action: &Action,
    state: &SessionState,
    oracle: &dyn Oracle,
) -> Result<(String, String), String> {
    let tables = match action {
        Action::QueryAnalysis { tables, .. } => tables.clone(),
        _ => Vec::new(),
    };
    let schema_subset: Vec<_> = state
        .schema_snapshot
        .tables
        .iter()
        .filter(|table| tables.is_empty() || tables.contains(&table.name))
        .collect();
    let table_notes: Vec<&str> = if tables.is_empty() {
        state.knowledge_index.values().map(String::as_str).collect()
    } else {
        tables
            .iter()
            .filter_map(|table| state.knowledge_index.get(table).map(String::as_str))
            .collect()
    };

    let payload = json!({
        "action": action,
        "schema": schema_subset,
        "table_notes": table_notes.join("\n"),
    });
    let raw = oracle
        .complete(&[
            ChatMessage::system(SQL_ANALYST_PROMPT),
            ChatMessage::user(payload.to_string()),
        ])
        .map_err(|err| format!("analyst oracle failed: {err}"))?;
    Ok(extract_sql(&raw))
}

/// Executes one `query_analysis` action end to end and records the step.
/// Every failure mode lands in the step's error field; the loop re-plans.
pub fn run_query_step(
    state: &mut SessionState,
    action: &Action,
    oracle: &dyn Oracle,
    config: &AgentConfig,
) {
    let step_id = step_id_or(action, "sql");
    let used_tables = match action {
        Action::QueryAnalysis { tables, .. } if !tables.is_empty() => Some(tables.clone()),
        _ => None,
    };
    let mut step = StepResult::new(&step_id, StepKind::QueryAnalysis, "");
    step.used_tables = used_tables;

    let drafted = if is_deterministic_analysis(action.id()) {
        deterministic_sql(action.id(), action, state, config)
    } else {
        oracle_sql(action, state, oracle)
    };

    let (sql, reasoning) = match drafted {
        Ok(drafted) => drafted,
        Err(error) => {
            step.summary = "Query drafting failed.".to_string();
            step.error = Some(error);
            let _ = append_agent_log_line(
                &config.cache_dir,
                &format!("[analyst][query] step={step_id} status=error stage=draft"),
            );
            state.record_step(step);
            return;
        }
    };

    match execute_query(&config.db_path, &sql, &config.cache_dir, config.max_query_rows) {
        Ok(summary) => {
            step.summary = format!(
                "{reasoning}\nRows: {}, Columns: [{}]",
                summary.row_count,
                summary.columns.join(", ")
            );
            step.artifact_id = Some(summary.artifact_id.clone());
            step.artifact_path = Some(summary.csv_path.display().to_string());
            let _ = append_agent_log_line(
                &config.cache_dir,
                &format!(
                    "[analyst][query] step={step_id} status=ok rows={} artifact={}",
                    summary.row_count, summary.artifact_id
                ),
            );
            if let Err(error) = state.insert_artifact(summary.to_artifact()) {
                step.artifact_id = None;
                step.artifact_path = None;
                step.error = Some(error);
            }
        }
        Err(err) => {
            let excerpt = crate::agent::truncate_chars(&sql, SQL_ERROR_EXCERPT_CHARS);
            step.summary = format!("{reasoning}\nSQL attempted: {excerpt}");
            step.error = Some(err.to_string());
            let stage = if matches!(err, QueryError::Disallowed) {
                "validation"
            } else {
                "execution"
            };
            let _ = append_agent_log_line(
                &config.cache_dir,
                &format!("[analyst][query] step={step_id} status=error stage={stage}"),
            );
        }
    }

    state.record_step(step);
}

/// Executes one `computation_analysis` action: asks the oracle for a
/// declarative pipeline, runs it against persisted artifacts, records the
/// step. Validation and execution failures are both captured as step errors.
pub fn run_computation_step(
    state: &mut SessionState,
    action: &Action,
    oracle: &dyn Oracle,
    config: &AgentConfig,
) {
    let step_id = step_id_or(action, "pipeline");
    let mut step = StepResult::new(&step_id, StepKind::ComputationAnalysis, "");

    let datasets = state.artifact_paths();
    let artifact_summaries: Vec<_> = state
        .data_artifacts
        .values()
        .map(|artifact| {
            json!({
                "dataset": artifact.artifact_id,
                "row_count": artifact.row_count,
                "columns": artifact.columns,
                "sample_preview": artifact.sample_preview,
            })
        })
        .collect();

    let payload = json!({
        "action": action,
        "datasets": artifact_summaries,
    });
    let raw = match oracle.complete(&[
        ChatMessage::system(PIPELINE_ANALYST_PROMPT),
        ChatMessage::user(payload.to_string()),
    ]) {
        Ok(raw) => raw,
        Err(err) => {
            step.summary = "Pipeline drafting failed.".to_string();
            step.error = Some(format!("analyst oracle failed: {err}"));
            state.record_step(step);
            return;
        }
    };

    let rationale = extract_rationale(&raw);
    let outcome = crate::compute::parse_pipeline(&raw)
        .and_then(|pipeline| crate::compute::run_pipeline(&pipeline, &datasets, &config.cache_dir));

    match outcome {
        Ok(outcome) => {
            step.summary = format!("{rationale}\n{}", outcome.summary_text);
            step.metrics = Some(outcome.metrics);
            step.plots = Some(outcome.plot_paths.clone());
            let _ = append_agent_log_line(
                &config.cache_dir,
                &format!(
                    "[analyst][pipeline] step={step_id} status=ok plots={}",
                    outcome.plot_paths.len()
                ),
            );
        }
        Err(err) => {
            step.summary = rationale;
            step.error = Some(err.to_string());
            let stage = if err.is_validation() {
                "validation"
            } else {
                "execution"
            };
            let _ = append_agent_log_line(
                &config.cache_dir,
                &format!("[analyst][pipeline] step={step_id} status=error stage={stage}"),
            );
        }
    }

    state.record_step(step);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleError;
    use crate::session::DatabaseSchema;
    use rusqlite::Connection;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    struct ScriptedOracle(String);

    impl Oracle for ScriptedOracle {
        fn complete(&self, _messages: &[ChatMessage]) -> Result<String, OracleError> {
            Ok(self.0.clone())
        }
    }

    fn seeded_config(dir: &std::path::Path) -> AgentConfig {
        let db_path = dir.join("fab.sqlite");
        let connection = Connection::open(&db_path).expect("open");
        connection
            .execute_batch(
                "CREATE TABLE defects_daily (date TEXT, tool TEXT, recipe TEXT, pre_defectwise_count INTEGER);
                 INSERT INTO defects_daily VALUES
                   ('2026-08-20', '8950XR-P2', 'S13Layer', 40),
                   ('2026-08-21', '8950XR-P2', 'S13Layer', 44);",
            )
            .expect("seed");

        let mut config = AgentConfig::default();
        config.db_path = db_path;
        config.cache_dir = dir.join("cache");
        config
    }

    fn fresh_state() -> SessionState {
        SessionState::new(
            "How many defects this week?",
            DatabaseSchema::default(),
            String::new(),
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn sql_extraction_prefers_json_then_fence_then_raw() {
        let (sql, reasoning) =
            extract_sql(r#"{"sql": "SELECT 1", "reasoning": "smoke check"}"#);
        assert_eq!(sql, "SELECT 1");
        assert_eq!(reasoning, "smoke check");

        let (sql, _) = extract_sql("Here you go:\n```sql\nSELECT tool FROM defects_daily\n```");
        assert_eq!(sql, "SELECT tool FROM defects_daily");

        let (sql, _) = extract_sql("SELECT 2");
        assert_eq!(sql, "SELECT 2");
    }

    #[test]
    fn oracle_drafted_query_records_step_and_artifact() {
        let dir = tempdir().expect("tempdir");
        let config = seeded_config(dir.path());
        let mut state = fresh_state();
        let action = Action::QueryAnalysis {
            id: "adhoc".to_string(),
            description: "count defects".to_string(),
            tables: vec!["defects_daily".to_string()],
            target_artifact_id: None,
            tool: None,
            date_from: None,
            date_to: None,
        };
        let oracle = ScriptedOracle(
            r#"{"sql": "SELECT tool, SUM(pre_defectwise_count) AS total FROM defects_daily GROUP BY tool", "reasoning": "weekly totals"}"#.to_string(),
        );

        run_query_step(&mut state, &action, &oracle, &config);

        assert_eq!(state.step_results.len(), 1);
        let step = &state.step_results[0];
        assert_eq!(step.status(), "ok");
        assert!(step.summary.contains("weekly totals"));
        assert!(step.summary.contains("Rows: 1"));
        assert_eq!(state.data_artifacts.len(), 1);
        let artifact = state.data_artifacts.values().next().expect("artifact");
        assert_eq!(artifact.columns, vec!["tool", "total"]);
    }

    #[test]
    fn deterministic_analysis_requires_a_valid_tool() {
        let dir = tempdir().expect("tempdir");
        let config = seeded_config(dir.path());
        let mut state = fresh_state();
        let action = Action::QueryAnalysis {
            id: "defect_drift_weekly".to_string(),
            description: String::new(),
            tables: Vec::new(),
            target_artifact_id: None,
            tool: Some("UNIT-2".to_string()),
            date_from: None,
            date_to: None,
        };

        run_query_step(&mut state, &action, &ScriptedOracle(String::new()), &config);

        let step = &state.step_results[0];
        assert_eq!(step.status(), "error");
        assert!(step.error.as_deref().unwrap().contains("Tool must be one of"));
        assert!(state.data_artifacts.is_empty());
    }

    #[test]
    fn deterministic_drift_analysis_runs_without_the_oracle() {
        let dir = tempdir().expect("tempdir");
        let config = seeded_config(dir.path());
        let mut state = fresh_state();
        let action = Action::QueryAnalysis {
            id: "defect_drift_weekly".to_string(),
            description: String::new(),
            tables: Vec::new(),
            target_artifact_id: None,
            tool: Some("8950xr-p2".to_string()),
            date_from: None,
            date_to: None,
        };

        // No scripted output: the deterministic path must never consult it.
        struct PanicOracle;
        impl Oracle for PanicOracle {
            fn complete(&self, _messages: &[ChatMessage]) -> Result<String, OracleError> {
                panic!("deterministic path must not call the oracle");
            }
        }

        run_query_step(&mut state, &action, &PanicOracle, &config);
        let step = &state.step_results[0];
        assert_eq!(step.status(), "ok");
        assert!(step.artifact_id.is_some());
    }

    #[test]
    fn trend_range_rejects_malformed_dates() {
        let dir = tempdir().expect("tempdir");
        let config = seeded_config(dir.path());
        let mut state = fresh_state();
        let action = Action::QueryAnalysis {
            id: "defect_trend_range".to_string(),
            description: String::new(),
            tables: Vec::new(),
            target_artifact_id: None,
            tool: Some("8950XR-P2".to_string()),
            date_from: Some("08/20/2026".to_string()),
            date_to: Some("2026-08-28".to_string()),
        };

        run_query_step(&mut state, &action, &ScriptedOracle(String::new()), &config);
        let step = &state.step_results[0];
        assert_eq!(step.status(), "error");
        assert!(step.error.as_deref().unwrap().contains("YYYY-MM-DD"));
    }

    #[test]
    fn bad_column_is_captured_as_a_step_error() {
        let dir = tempdir().expect("tempdir");
        let config = seeded_config(dir.path());
        let mut state = fresh_state();
        let action = Action::QueryAnalysis {
            id: "adhoc".to_string(),
            description: String::new(),
            tables: Vec::new(),
            target_artifact_id: None,
            tool: None,
            date_from: None,
            date_to: None,
        };
        let oracle =
            ScriptedOracle(r#"{"sql": "SELECT missing_col FROM defects_daily"}"#.to_string());

        run_query_step(&mut state, &action, &oracle, &config);
        let step = &state.step_results[0];
        assert_eq!(step.status(), "error");
        assert!(step.summary.contains("SQL attempted"));
        assert!(state.data_artifacts.is_empty());
    }

    #[test]
    fn computation_step_runs_a_pipeline_over_an_artifact() {
        let dir = tempdir().expect("tempdir");
        let config = seeded_config(dir.path());
        let mut state = fresh_state();

        // Seed an artifact the way a prior query step would.
        let query_action = Action::QueryAnalysis {
            id: "adhoc".to_string(),
            description: String::new(),
            tables: Vec::new(),
            target_artifact_id: None,
            tool: None,
            date_from: None,
            date_to: None,
        };
        let query_oracle = ScriptedOracle(
            r#"{"sql": "SELECT date, tool, pre_defectwise_count FROM defects_daily"}"#.to_string(),
        );
        run_query_step(&mut state, &query_action, &query_oracle, &config);
        let artifact_id = state.data_artifacts.keys().next().expect("artifact").clone();

        let compute_action = Action::ComputationAnalysis {
            id: "trend".to_string(),
            description: "defect trend".to_string(),
            tables: Vec::new(),
            target_artifact_id: Some(artifact_id.clone()),
        };
        let pipeline_oracle = ScriptedOracle(format!(
            r#"{{"pipeline": {{"dataset": "{artifact_id}", "metrics": [{{"name": "total", "agg": "sum", "column": "pre_defectwise_count"}}]}}, "rationale": "sum the counts"}}"#
        ));

        run_computation_step(&mut state, &compute_action, &pipeline_oracle, &config);
        let step = state.step_results.last().expect("step");
        assert_eq!(step.status(), "ok");
        assert!(step.summary.contains("sum the counts"));
        assert_eq!(
            step.metrics.as_ref().and_then(|m| m.get("total")).copied(),
            Some(84.0)
        );
        assert!(step.plots.as_ref().is_some_and(|plots| plots.is_empty()));
    }

    #[test]
    fn invalid_pipeline_is_captured_not_propagated() {
        let dir = tempdir().expect("tempdir");
        let config = seeded_config(dir.path());
        let mut state = fresh_state();
        let action = Action::ComputationAnalysis {
            id: "trend".to_string(),
            description: String::new(),
            tables: Vec::new(),
            target_artifact_id: None,
        };
        let oracle = ScriptedOracle(
            r#"{"pipeline": {"dataset": "qr-x", "steps": [{"op": "exec", "cmd": "ls"}]}}"#.to_string(),
        );

        run_computation_step(&mut state, &action, &oracle, &config);
        let step = &state.step_results[0];
        assert_eq!(step.status(), "error");
        assert!(step.error.as_deref().unwrap().contains("invalid pipeline"));
    }
}
