use crate::agent::prompts::SUPERVISOR_PROMPT;
use crate::agent::{truncate_chars, KNOWLEDGE_PROMPT_CHARS, RESULT_WINDOW};
use crate::config::AgentConfig;
use crate::oracle::{strip_code_fence, ChatMessage, Oracle};
use crate::query::templates::sanitize_tool;
use crate::session::{Action, ClarificationRequest, SessionState, StepResult};

const HEALTH_KEYWORDS: [&str; 4] = ["health", "status", "drift", "condition"];

pub fn is_health_question(query: &str) -> bool {
    let lowered = query.to_lowercase();
    HEALTH_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Looks for a configured tool id in the user query or in prior clarification
/// answers. Substring match is case-insensitive; answers are also accepted as
/// bare tool ids.
pub fn resolve_tool_id(state: &SessionState, fleet: &[String]) -> Option<String> {
    let upper_query = state.user_query.to_uppercase();
    if let Some(tool) = fleet
        .iter()
        .find(|tool| upper_query.contains(&tool.to_uppercase()))
    {
        return Some(tool.clone());
    }
    for answer in state.clarification_answers.values() {
        if let Some(tool) = sanitize_tool(answer, fleet) {
            return Some(tool);
        }
        let upper = answer.to_uppercase();
        if let Some(tool) = fleet
            .iter()
            .find(|tool| upper.contains(&tool.to_uppercase()))
        {
            return Some(tool.clone());
        }
    }
    None
}

pub fn clarification_question(fleet: &[String]) -> String {
    format!(
        "Which tool do you want me to check? ({})",
        fleet.join(", ")
    )
}

/// Compact textual summary of prior steps for the planning prompt.
pub fn summarize_results(results: &[StepResult]) -> String {
    results
        .iter()
        .map(|step| match step.error.as_deref() {
            Some(error) => format!("{} [error]: {}", step.kind, error),
            None => format!("{}: {}", step.kind, step.summary),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decodes oracle output into an action. Undecodable output, including an
/// unknown or missing action kind, degrades to `finish` carrying the raw text
/// as a diagnostic note so the turn always terminates.
pub fn decode_action(raw: &str) -> Action {
    let cleaned = strip_code_fence(raw);
    match serde_json::from_str::<Action>(cleaned) {
        Ok(action) => action,
        Err(_) => Action::finish(
            "finish",
            format!("Could not parse planning output; finishing. Raw response: {raw}"),
        ),
    }
}

fn build_messages(state: &SessionState, config: &AgentConfig) -> Vec<ChatMessage> {
    let schema_text =
        serde_json::to_string(&state.schema_snapshot).unwrap_or_else(|_| "{}".to_string());
    let clarifications =
        serde_json::to_string(&state.clarification_answers).unwrap_or_else(|_| "{}".to_string());
    let previous = summarize_results(state.recent_results(RESULT_WINDOW));
    let knowledge = truncate_chars(&state.knowledge_text, KNOWLEDGE_PROMPT_CHARS);
    let fleet = config.tool_ids.join(", ");

    vec![
        ChatMessage::system(SUPERVISOR_PROMPT),
        ChatMessage::user(format!(
            "User query:\n{}\n\nClarification answers:\n{}\n\nValid tool ids:\n{}\n\nDatabase schema:\n{}\n\nMarkdown knowledge:\n{}\n\nRecent results:\n{}",
            state.user_query, clarifications, fleet, schema_text, knowledge, previous
        )),
    ]
}

/// One decision-engine invocation. Increments the loop counter, enforces the
/// loop guard and the clarification precondition before consulting the
/// oracle, and maintains `pending_clarification` as a side effect.
pub fn decide(state: &mut SessionState, oracle: &dyn Oracle, config: &AgentConfig) -> Action {
    state.loop_count += 1;

    if state.loop_count > config.loop_bound {
        state.pending_clarification = None;
        return Action::finish(
            "auto_finish",
            format!(
                "Loop guard triggered after {} decisions; aggregating available findings.",
                state.loop_count
            ),
        );
    }

    // Ask once per turn chain: if the user already replied to a tool_id
    // request (even unresolvably) the oracle handles it instead of an
    // identical re-ask.
    if is_health_question(&state.user_query)
        && resolve_tool_id(state, &config.tool_ids).is_none()
        && !state.clarification_answers.contains_key("tool_id")
    {
        let question = clarification_question(&config.tool_ids);
        state.pending_clarification = Some(ClarificationRequest {
            id: "tool_id".to_string(),
            question: question.clone(),
        });
        return Action::AskUser {
            id: "tool_id".to_string(),
            description: "A tool id is required before health analysis can run.".to_string(),
            clarification_question: Some(question),
        };
    }

    let action = match oracle.complete(&build_messages(state, config)) {
        Ok(raw) => decode_action(&raw),
        Err(err) => Action::finish("finish", format!("Planning oracle failed: {err}")),
    };

    match &action {
        Action::AskUser {
            id,
            clarification_question,
            ..
        } => {
            state.pending_clarification = Some(ClarificationRequest {
                id: if id.is_empty() {
                    "clarify".to_string()
                } else {
                    id.clone()
                },
                question: clarification_question
                    .clone()
                    .unwrap_or_else(|| "Please provide more detail.".to_string()),
            });
        }
        _ => state.pending_clarification = None,
    }

    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleError;
    use crate::session::{ActionKind, DatabaseSchema, StepKind};
    use std::collections::BTreeMap;

    struct ScriptedOracle(String);

    impl Oracle for ScriptedOracle {
        fn complete(&self, _messages: &[ChatMessage]) -> Result<String, OracleError> {
            Ok(self.0.clone())
        }
    }

    struct FailingOracle;

    impl Oracle for FailingOracle {
        fn complete(&self, _messages: &[ChatMessage]) -> Result<String, OracleError> {
            Err(OracleError::Request("connection refused".to_string()))
        }
    }

    fn state_for(query: &str, answers: &[(&str, &str)]) -> SessionState {
        let answers = answers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>();
        SessionState::new(
            query,
            DatabaseSchema::default(),
            String::new(),
            BTreeMap::new(),
            answers,
        )
    }

    #[test]
    fn health_questions_are_recognized() {
        assert!(is_health_question("How healthy is 8950XR-P2?"));
        assert!(is_health_question("tool STATUS please"));
        assert!(is_health_question("any drift on WadiLayer?"));
        assert!(!is_health_question("list the recipes we track"));
    }

    #[test]
    fn tool_id_resolves_from_query_or_answers() {
        let config = AgentConfig::default();
        let state = state_for("How healthy is 8950xr-p2?", &[]);
        assert_eq!(
            resolve_tool_id(&state, &config.tool_ids),
            Some("8950XR-P2".to_string())
        );

        let state = state_for("How healthy is my tool?", &[("tool_id", "8950XR-P4")]);
        assert_eq!(
            resolve_tool_id(&state, &config.tool_ids),
            Some("8950XR-P4".to_string())
        );

        let state = state_for("How healthy is UNIT-2?", &[]);
        assert_eq!(resolve_tool_id(&state, &config.tool_ids), None);
    }

    #[test]
    fn missing_tool_id_forces_ask_user_without_oracle() {
        let config = AgentConfig::default();
        let mut state = state_for("How healthy is UNIT-2?", &[]);

        // The failing oracle proves the precondition path never consults it.
        let action = decide(&mut state, &FailingOracle, &config);
        assert_eq!(action.kind(), ActionKind::AskUser);
        let pending = state.pending_clarification.as_ref().expect("pending");
        assert_eq!(pending.id, "tool_id");
        assert!(pending.question.contains("8950XR-P1"));
        assert!(pending.question.contains("8950XR-P4"));
        assert_eq!(state.loop_count, 1);
    }

    #[test]
    fn clarification_answer_unblocks_the_oracle_path() {
        let config = AgentConfig::default();
        let mut state = state_for("How healthy is my tool?", &[("tool_id", "8950XR-P2")]);

        let oracle = ScriptedOracle(
            r#"{"action_type":"query_analysis","id":"defect_drift_weekly","description":"check drift","tool":"8950XR-P2"}"#.to_string(),
        );
        let action = decide(&mut state, &oracle, &config);
        assert_eq!(action.kind(), ActionKind::QueryAnalysis);
        assert!(state.pending_clarification.is_none());
    }

    #[test]
    fn unresolvable_answer_does_not_retrigger_the_same_clarification() {
        let config = AgentConfig::default();
        let mut state = state_for("How healthy is UNIT-2?", &[("tool_id", "UNIT-2")]);

        let oracle = ScriptedOracle(
            r#"{"action_type":"finish","id":"finish","description":"UNIT-2 is not a known tool id"}"#.to_string(),
        );
        let action = decide(&mut state, &oracle, &config);
        assert_eq!(action.kind(), ActionKind::Finish);
        assert!(state.pending_clarification.is_none());
    }

    #[test]
    fn loop_guard_bypasses_the_oracle_and_mentions_the_guard() {
        let config = AgentConfig::default();
        let mut state = state_for("list recipes", &[]);
        state.loop_count = config.loop_bound;

        let action = decide(&mut state, &FailingOracle, &config);
        assert_eq!(action.kind(), ActionKind::Finish);
        assert!(action.description().contains("Loop guard"));
        assert_eq!(state.loop_count, config.loop_bound + 1);
        assert!(state.pending_clarification.is_none());
    }

    #[test]
    fn undecodable_oracle_output_degrades_to_finish_with_raw_text() {
        let action = decode_action("I think you should probably run some SQL");
        assert_eq!(action.kind(), ActionKind::Finish);
        assert!(action.description().contains("probably run some SQL"));

        let unknown_kind = decode_action(r#"{"action_type":"reboot_fab","id":"x"}"#);
        assert_eq!(unknown_kind.kind(), ActionKind::Finish);
    }

    #[test]
    fn fenced_action_json_still_decodes() {
        let action = decode_action(
            "```json\n{\"action_type\":\"knowledge_explain\",\"id\":\"explain\",\"description\":\"interpret\"}\n```",
        );
        assert_eq!(action.kind(), ActionKind::KnowledgeExplain);
    }

    #[test]
    fn oracle_failure_degrades_to_finish() {
        let config = AgentConfig::default();
        let mut state = state_for("list recipes", &[]);
        let action = decide(&mut state, &FailingOracle, &config);
        assert_eq!(action.kind(), ActionKind::Finish);
        assert!(action.description().contains("oracle failed"));
    }

    #[test]
    fn ask_user_from_oracle_sets_pending_clarification() {
        let config = AgentConfig::default();
        let mut state = state_for("compare recipes", &[]);
        let oracle = ScriptedOracle(
            r#"{"action_type":"ask_user","id":"date_range","clarification_question":"Which date range?"}"#.to_string(),
        );
        let action = decide(&mut state, &oracle, &config);
        assert_eq!(action.kind(), ActionKind::AskUser);
        let pending = state.pending_clarification.expect("pending");
        assert_eq!(pending.id, "date_range");
        assert_eq!(pending.question, "Which date range?");
    }

    #[test]
    fn summaries_flag_failed_steps() {
        let mut ok = StepResult::new("s1", StepKind::QueryAnalysis, "Rows: 4");
        let mut bad = StepResult::new("s2", StepKind::QueryAnalysis, "attempted");
        bad.error = Some("no such column".to_string());
        ok.summary = "Rows: 4".to_string();

        let text = summarize_results(&[ok, bad]);
        assert!(text.contains("query_analysis: Rows: 4"));
        assert!(text.contains("query_analysis [error]: no such column"));
    }
}
