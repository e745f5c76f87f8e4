use crate::agent::prompts::SYNTHESIZER_PROMPT;
use crate::agent::supervisor::summarize_results;
use crate::config::AgentConfig;
use crate::oracle::{ChatMessage, Oracle};
use crate::session::{SessionState, StepKind, StepResult};
use crate::shared::append_agent_log_line;

fn narratives(state: &SessionState) -> String {
    state
        .step_results
        .iter()
        .filter_map(|step| step.narrative.as_deref())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn build_messages(state: &SessionState, finish_note: &str) -> Vec<ChatMessage> {
    let findings = summarize_results(&state.step_results);
    let clarifications =
        serde_json::to_string(&state.clarification_answers).unwrap_or_else(|_| "{}".to_string());
    vec![
        ChatMessage::system(SYNTHESIZER_PROMPT),
        ChatMessage::user(format!(
            "User question:\n{}\n\nClarification answers:\n{}\n\nPlanner note:\n{}\n\nStep findings:\n{}\n\nExpert narratives:\n{}",
            state.user_query,
            clarifications,
            finish_note,
            findings,
            narratives(state)
        )),
    ]
}

/// Assembles the answer shown when the synthesis oracle is unavailable, built
/// from what the turn actually produced.
fn degraded_answer(state: &SessionState, finish_note: &str) -> String {
    let mut lines = vec![
        "I could not reach the language model to write a final summary.".to_string(),
        format!("Planner note: {finish_note}"),
    ];
    if state.step_results.is_empty() {
        lines.push("No analysis steps completed this turn.".to_string());
    } else {
        lines.push("Raw findings:".to_string());
        for step in &state.step_results {
            lines.push(format!("- [{}] {}", step.status(), step.summary));
        }
    }
    lines.join("\n")
}

/// Produces the final answer for the turn and records it on the session. A
/// synthesis oracle failure never loses the turn's findings; it degrades to a
/// plain listing instead.
pub fn synthesize(
    state: &mut SessionState,
    oracle: &dyn Oracle,
    config: &AgentConfig,
    finish_note: &str,
) -> String {
    let (answer, status) = match oracle.complete(&build_messages(state, finish_note)) {
        Ok(text) => (text.trim().to_string(), "ok"),
        Err(_) => (degraded_answer(state, finish_note), "degraded"),
    };
    let _ = append_agent_log_line(
        &config.cache_dir,
        &format!("[synthesizer] status={status} steps={}", state.step_results.len()),
    );

    let mut step = StepResult::new("synthesize", StepKind::Finish, "Final answer produced.");
    if status == "degraded" {
        step.summary = "Final answer degraded to a raw findings listing.".to_string();
    }
    state.record_step(step);
    state.final_answer = Some(answer.clone());
    answer
}
