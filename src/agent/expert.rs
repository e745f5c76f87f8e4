use crate::agent::prompts::DOMAIN_EXPERT_PROMPT;
use crate::agent::supervisor::summarize_results;
use crate::agent::{truncate_chars, KNOWLEDGE_PROMPT_CHARS, RESULT_WINDOW};
use crate::config::AgentConfig;
use crate::oracle::{ChatMessage, Oracle};
use crate::session::{Action, SessionState, StepKind, StepResult};
use crate::shared::append_agent_log_line;

const NARRATIVE_SUMMARY_CHARS: usize = 200;

fn build_messages(state: &SessionState, focus: &str) -> Vec<ChatMessage> {
    let findings = summarize_results(state.recent_results(RESULT_WINDOW));
    let knowledge = truncate_chars(&state.knowledge_text, KNOWLEDGE_PROMPT_CHARS);
    vec![
        ChatMessage::system(DOMAIN_EXPERT_PROMPT),
        ChatMessage::user(format!(
            "User question:\n{}\n\nFocus:\n{}\n\nRecent findings:\n{}\n\nMarkdown knowledge:\n{}",
            state.user_query, focus, findings, knowledge
        )),
    ]
}

/// Executes one `knowledge_explain` action: asks the domain expert oracle to
/// interpret recent numeric findings against the Markdown knowledge and
/// records the narrative as a step. Returns a proposed `finish`; the proposal
/// also rides along in the step summary so the next planning pass sees it,
/// and the planner is free to override it.
pub fn run_knowledge_step(
    state: &mut SessionState,
    action: &Action,
    oracle: &dyn Oracle,
    config: &AgentConfig,
) -> Action {
    let step_id = if action.id().is_empty() {
        "explain".to_string()
    } else {
        action.id().to_string()
    };
    let focus = if action.description().is_empty() {
        "Interpret the findings so far."
    } else {
        action.description()
    };
    let mut step = StepResult::new(&step_id, StepKind::KnowledgeExplain, "");

    match oracle.complete(&build_messages(state, focus)) {
        Ok(narrative) => {
            let narrative = narrative.trim().to_string();
            step.summary = format!(
                "{}\nNext: finish.",
                truncate_chars(&narrative, NARRATIVE_SUMMARY_CHARS)
            );
            step.narrative = Some(narrative);
            let _ = append_agent_log_line(
                &config.cache_dir,
                &format!("[expert] step={step_id} status=ok proposes=finish"),
            );
        }
        Err(err) => {
            step.summary = "Domain interpretation failed.\nNext: finish.".to_string();
            step.error = Some(format!("expert oracle failed: {err}"));
            let _ = append_agent_log_line(
                &config.cache_dir,
                &format!("[expert] step={step_id} status=error proposes=finish"),
            );
        }
    }

    state.record_step(step);
    Action::finish("finish", "Explanation recorded; ready to synthesize.")
}
