use chrono::{Duration, Local};
use fabsight::agent::{run_turn, TurnRequest};
use fabsight::config::AgentConfig;
use fabsight::oracle::{ChatMessage, Oracle, OracleError};
use fabsight::session::StepKind;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tempfile::tempdir;

/// Replays responses in order and repeats the last one when exhausted.
struct ScriptOracle {
    responses: Mutex<Vec<String>>,
}

impl ScriptOracle {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
        }
    }
}

impl Oracle for ScriptOracle {
    fn complete(&self, _messages: &[ChatMessage]) -> Result<String, OracleError> {
        let mut responses = self.responses.lock().expect("lock");
        if responses.len() > 1 {
            Ok(responses.pop().expect("scripted response"))
        } else {
            Ok(responses.last().cloned().unwrap_or_default())
        }
    }
}

/// Any consultation is a test failure.
struct PanicOracle;

impl Oracle for PanicOracle {
    fn complete(&self, _messages: &[ChatMessage]) -> Result<String, OracleError> {
        panic!("oracle must not be consulted in this scenario");
    }
}

fn date_offset(days: i64) -> String {
    (Local::now().date_naive() + Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}

/// Two weeks of defect counts for two tools. 8950XR-P2 jumps well past the
/// ten-percent weekly threshold on S13Layer; 8950XR-P1 stays flat.
fn seed_database(db_path: &Path) {
    let connection = Connection::open(db_path).expect("open sqlite");
    connection
        .execute_batch(
            "CREATE TABLE defects_daily (date TEXT, tool TEXT, recipe TEXT, pre_defectwise_count INTEGER);
             CREATE TABLE calibrations (tool TEXT, subsystem TEXT, cal_name TEXT, last_cal_date TEXT, freq_days INTEGER);
             CREATE TABLE wc_points (date TEXT, tool TEXT, recipe TEXT, x REAL, y REAL);",
        )
        .expect("create tables");
    let rows = [
        (date_offset(-9), "8950XR-P2", "S13Layer", 30),
        (date_offset(-8), "8950XR-P2", "S13Layer", 32),
        (date_offset(-2), "8950XR-P2", "S13Layer", 55),
        (date_offset(-1), "8950XR-P2", "S13Layer", 58),
        (date_offset(-9), "8950XR-P1", "S13Layer", 30),
        (date_offset(-8), "8950XR-P1", "S13Layer", 31),
        (date_offset(-2), "8950XR-P1", "S13Layer", 30),
        (date_offset(-1), "8950XR-P1", "S13Layer", 32),
    ];
    for (date, tool, recipe, count) in rows {
        connection
            .execute(
                "INSERT INTO defects_daily VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![date, tool, recipe, count],
            )
            .expect("insert row");
    }
    // One calibration long overdue, one fresh.
    connection
        .execute(
            "INSERT INTO calibrations VALUES ('8950XR-P2', 'stage', 'xy_offset', ?1, 30)",
            rusqlite::params![date_offset(-90)],
        )
        .expect("insert calibration");
    connection
        .execute(
            "INSERT INTO calibrations VALUES ('8950XR-P2', 'optics', 'focus', ?1, 90)",
            rusqlite::params![date_offset(-5)],
        )
        .expect("insert calibration");
    // Wafer-center points this week: one abnormal (|x| > 150), one normal.
    connection
        .execute(
            "INSERT INTO wc_points VALUES (?1, '8950XR-P2', 'S13Layer', 180.0, 20.0)",
            rusqlite::params![date_offset(-1)],
        )
        .expect("insert wc point");
    connection
        .execute(
            "INSERT INTO wc_points VALUES (?1, '8950XR-P2', 'S13Layer', 10.0, -12.0)",
            rusqlite::params![date_offset(-1)],
        )
        .expect("insert wc point");
}

fn seed_docs(docs_path: &Path) {
    fs::create_dir_all(docs_path).expect("docs dir");
    fs::write(
        docs_path.join("drift_rules.md"),
        "# File: drift rules\n\n## Table: defects_daily\nWeekly diffs above 10% are anomalous.\nTwo or more anomalous tools on a recipe means process drift; exactly one means tool drift.\n",
    )
    .expect("write doc");
}

fn config_for(dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.db_path = dir.join("fab.sqlite");
    config.docs_path = dir.join("docs");
    config.cache_dir = dir.join("cache");
    config
}

#[test]
fn health_question_flows_query_explain_finish() {
    let dir = tempdir().expect("tempdir");
    let config = config_for(dir.path());
    seed_database(&config.db_path);
    seed_docs(&config.docs_path);

    let oracle = ScriptOracle::new(&[
        r#"{"action_type":"query_analysis","id":"defect_drift_weekly","description":"weekly drift labels","tool":"8950XR-P2"}"#,
        r#"{"action_type":"knowledge_explain","id":"explain","description":"interpret drift labels"}"#,
        "8950XR-P2 shows rising defects on S13Layer consistent with tool drift.",
        r#"{"action_type":"finish","id":"finish","description":"evidence gathered"}"#,
        "Overall: 8950XR-P2 is unhealthy; S13Layer defects rose well past the weekly threshold.",
    ]);

    let state = run_turn(
        &TurnRequest::new("How healthy is 8950XR-P2?"),
        &oracle,
        &config,
    )
    .expect("turn");

    let kinds: Vec<StepKind> = state.step_results.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StepKind::QueryAnalysis,
            StepKind::KnowledgeExplain,
            StepKind::Finish
        ]
    );
    assert_eq!(state.loop_count, 3);
    assert!(state
        .final_answer
        .as_deref()
        .expect("answer")
        .starts_with("Overall: 8950XR-P2 is unhealthy"));

    // The drift artifact is on disk with the labeled columns.
    let artifact = state.data_artifacts.values().next().expect("artifact");
    let csv = fs::read_to_string(&artifact.csv_path).expect("read artifact");
    let header = csv.lines().next().expect("header");
    assert!(header.contains("drift_label"));
    assert!(header.contains("tool_health"));
    assert!(csv.contains("8950XR-P2"));
    assert!(!csv.contains("8950XR-P1"));
}

#[test]
fn clarification_round_trip_across_two_turns() {
    let dir = tempdir().expect("tempdir");
    let config = config_for(dir.path());
    seed_database(&config.db_path);
    seed_docs(&config.docs_path);

    // Turn one: health question with an unknown tool id stops before any
    // oracle consultation.
    let first = run_turn(
        &TurnRequest::new("How healthy is UNIT-2?"),
        &PanicOracle,
        &config,
    )
    .expect("first turn");
    let pending = first.pending_clarification.expect("clarification");
    assert_eq!(pending.id, "tool_id");
    assert!(pending.question.contains("8950XR-P1"));
    assert!(pending.question.contains("8950XR-P4"));
    assert!(first.final_answer.is_none());
    assert_eq!(first.loop_count, 1);

    // Turn two: the answer resolves the tool and the loop proceeds.
    let oracle = ScriptOracle::new(&[
        r#"{"action_type":"query_analysis","id":"defect_drift_weekly","description":"drift check","tool":"8950XR-P2"}"#,
        r#"{"action_type":"finish","id":"finish","description":"drift labels computed"}"#,
        "8950XR-P2 looks degraded this week.",
    ]);
    let request =
        TurnRequest::new("How healthy is UNIT-2?").with_answer("tool_id", "8950XR-P2");
    let second = run_turn(&request, &oracle, &config).expect("second turn");

    assert!(second.pending_clarification.is_none());
    assert_eq!(
        second.final_answer.as_deref(),
        Some("8950XR-P2 looks degraded this week.")
    );
    assert_eq!(second.data_artifacts.len(), 1);
}

#[test]
fn unresolvable_clarification_answer_is_not_asked_again() {
    let dir = tempdir().expect("tempdir");
    let config = config_for(dir.path());
    seed_database(&config.db_path);
    seed_docs(&config.docs_path);

    // The user answered with an id outside the fleet. The loop must move on
    // to the planner instead of repeating the identical question.
    let oracle = ScriptOracle::new(&[
        r#"{"action_type":"finish","id":"finish","description":"UNIT-2 is not a known tool id"}"#,
        "UNIT-2 is not one of the tools I track; valid ids are 8950XR-P1 through 8950XR-P4.",
    ]);
    let request = TurnRequest::new("How healthy is UNIT-2?").with_answer("tool_id", "UNIT-2");
    let state = run_turn(&request, &oracle, &config).expect("turn");

    assert!(state.pending_clarification.is_none());
    assert!(state
        .final_answer
        .as_deref()
        .expect("answer")
        .contains("not one of the tools"));
}

#[test]
fn disallowed_sql_is_rejected_and_nothing_mutates() {
    let dir = tempdir().expect("tempdir");
    let config = config_for(dir.path());
    seed_database(&config.db_path);
    seed_docs(&config.docs_path);

    let oracle = ScriptOracle::new(&[
        r#"{"action_type":"query_analysis","id":"cleanup","description":"remove old rows"}"#,
        r#"{"sql": "DELETE FROM defects_daily", "reasoning": "clear stale data"}"#,
        r#"{"action_type":"finish","id":"finish","description":"stopping"}"#,
        "I cannot modify the inspection data.",
    ]);

    let state = run_turn(&TurnRequest::new("delete old rows"), &oracle, &config).expect("turn");

    let first = &state.step_results[0];
    assert_eq!(first.status(), "error");
    assert!(first.error.as_deref().expect("error").contains("disallowed"));
    assert!(state.data_artifacts.is_empty());

    let connection = Connection::open(&config.db_path).expect("reopen");
    let count: i64 = connection
        .query_row("SELECT COUNT(*) FROM defects_daily", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 8);
}

#[test]
fn unbounded_queries_are_capped_at_the_configured_ceiling() {
    let dir = tempdir().expect("tempdir");
    let mut config = config_for(dir.path());
    config.max_query_rows = 3;
    seed_database(&config.db_path);
    seed_docs(&config.docs_path);

    let oracle = ScriptOracle::new(&[
        r#"{"action_type":"query_analysis","id":"all_rows","description":"list everything"}"#,
        r#"{"sql": "SELECT * FROM defects_daily", "reasoning": "full listing"}"#,
        r#"{"action_type":"finish","id":"finish","description":"done"}"#,
        "Listed the first rows.",
    ]);

    let state = run_turn(&TurnRequest::new("list defect rows"), &oracle, &config).expect("turn");

    let artifact = state.data_artifacts.values().next().expect("artifact");
    assert_eq!(artifact.row_count, 3);
}

#[test]
fn artifact_store_fault_is_survivable() {
    let dir = tempdir().expect("tempdir");
    let mut config = config_for(dir.path());
    seed_database(&config.db_path);
    seed_docs(&config.docs_path);
    // A file where the cache directory should be makes every artifact write
    // fail.
    config.cache_dir = dir.path().join("cache");
    fs::write(&config.cache_dir, "not a directory").expect("block cache dir");

    let oracle = ScriptOracle::new(&[
        r#"{"action_type":"query_analysis","id":"listing","description":"list rows"}"#,
        r#"{"sql": "SELECT * FROM defects_daily LIMIT 2", "reasoning": "sample rows"}"#,
        r#"{"action_type":"finish","id":"finish","description":"storage is failing"}"#,
        "I could not persist results, so here is what I know without them.",
    ]);

    let state = run_turn(&TurnRequest::new("list defect rows"), &oracle, &config).expect("turn");

    let first = &state.step_results[0];
    assert_eq!(first.status(), "error");
    assert!(state.data_artifacts.is_empty());
    assert!(state.final_answer.is_some());
}

#[test]
fn guard_terminates_a_planner_that_never_finishes() {
    let dir = tempdir().expect("tempdir");
    let config = config_for(dir.path());
    seed_database(&config.db_path);
    seed_docs(&config.docs_path);

    let oracle = ScriptOracle::new(&[
        r#"{"action_type":"knowledge_explain","id":"explain","description":"one more pass"}"#,
    ]);

    let state = run_turn(&TurnRequest::new("summarize the line"), &oracle, &config).expect("turn");

    assert_eq!(state.loop_count, config.loop_bound + 1);
    assert!(state.final_answer.is_some());
    assert_eq!(
        state.step_results.last().expect("finish step").kind,
        StepKind::Finish
    );
}

#[test]
fn calibration_and_stage_templates_run_against_the_database() {
    let dir = tempdir().expect("tempdir");
    let config = config_for(dir.path());
    seed_database(&config.db_path);
    seed_docs(&config.docs_path);

    let oracle = ScriptOracle::new(&[
        r#"{"action_type":"query_analysis","id":"calibration_overdue","description":"calibration check","tool":"8950XR-P2"}"#,
        r#"{"action_type":"query_analysis","id":"stage_wc_weekly","description":"wafer center check","tool":"8950XR-P2"}"#,
        r#"{"action_type":"finish","id":"finish","description":"supporting evidence collected"}"#,
        "Calibration and stage checks are done.",
    ]);

    let state = run_turn(
        &TurnRequest::new("check drift evidence for 8950XR-P2"),
        &oracle,
        &config,
    )
    .expect("turn");

    assert_eq!(state.data_artifacts.len(), 2);
    for step in &state.step_results[..2] {
        assert_eq!(step.status(), "ok");
    }

    let mut headers: Vec<String> = Vec::new();
    for artifact in state.data_artifacts.values() {
        let csv = fs::read_to_string(&artifact.csv_path).expect("read artifact");
        headers.push(csv.lines().next().expect("header").to_string());
    }
    assert!(headers.iter().any(|h| h.contains("is_overdue")));
    assert!(headers.iter().any(|h| h.contains("wc_abnormal_ratio")));
}

#[test]
fn computation_follows_a_query_within_one_turn() {
    let dir = tempdir().expect("tempdir");
    let config = config_for(dir.path());
    seed_database(&config.db_path);
    seed_docs(&config.docs_path);

    let oracle = ScriptOracle::new(&[
        r#"{"action_type":"query_analysis","id":"p2_counts","description":"P2 daily counts"}"#,
        r#"{"sql": "SELECT date, pre_defectwise_count FROM defects_daily WHERE tool = '8950XR-P2' ORDER BY date", "reasoning": "daily counts for P2"}"#,
        r#"{"action_type":"computation_analysis","id":"trend","description":"total and peak"}"#,
        "__PIPELINE__",
        r#"{"action_type":"finish","id":"finish","description":"numbers in hand"}"#,
        "Totals computed for 8950XR-P2.",
    ]);
    // The pipeline references the artifact id minted during the turn, so the
    // placeholder is resolved through a second scripted oracle layer.
    struct Rewriting<'a> {
        inner: &'a ScriptOracle,
    }
    impl Oracle for Rewriting<'_> {
        fn complete(&self, messages: &[ChatMessage]) -> Result<String, OracleError> {
            let raw = self.inner.complete(messages)?;
            if raw == "__PIPELINE__" {
                // The analyst payload lists available datasets; lift the id
                // from the prompt itself.
                let prompt = &messages.last().expect("user message").content;
                let marker = "\"dataset\":\"";
                let start = prompt.find(marker).expect("dataset in prompt") + marker.len();
                let end = prompt[start..].find('"').expect("closing quote") + start;
                let id = &prompt[start..end];
                return Ok(format!(
                    r#"{{"pipeline": {{"dataset": "{id}", "metrics": [{{"name": "total", "agg": "sum", "column": "pre_defectwise_count"}}, {{"name": "peak", "agg": "max", "column": "pre_defectwise_count"}}]}}, "rationale": "sum and peak of daily counts"}}"#
                ));
            }
            Ok(raw)
        }
    }
    let oracle = Rewriting { inner: &oracle };

    let state =
        run_turn(&TurnRequest::new("total defects for 8950XR-P2"), &oracle, &config).expect("turn");

    let compute_step = state
        .step_results
        .iter()
        .find(|step| step.kind == StepKind::ComputationAnalysis)
        .expect("computation step");
    assert_eq!(compute_step.status(), "ok");
    let metrics = compute_step.metrics.as_ref().expect("metrics");
    assert_eq!(metrics.get("total").copied(), Some(175.0));
    assert_eq!(metrics.get("peak").copied(), Some(58.0));
    assert_eq!(
        state.final_answer.as_deref(),
        Some("Totals computed for 8950XR-P2.")
    );
}
