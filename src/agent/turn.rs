use crate::agent::{analyst, expert, supervisor, synthesizer};
use crate::config::AgentConfig;
use crate::context::{load_database_schema, load_markdown_knowledge, ContextError};
use crate::oracle::Oracle;
use crate::session::{Action, ActionKind, SessionState};
use crate::shared::append_agent_log_line;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Deciding,
    RunningQuery,
    RunningComputation,
    Explaining,
    AwaitingClarification,
    Synthesizing,
    Finished,
}

impl TurnPhase {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (TurnPhase::Deciding, TurnPhase::RunningQuery)
                | (TurnPhase::Deciding, TurnPhase::RunningComputation)
                | (TurnPhase::Deciding, TurnPhase::Explaining)
                | (TurnPhase::Deciding, TurnPhase::AwaitingClarification)
                | (TurnPhase::Deciding, TurnPhase::Synthesizing)
                | (TurnPhase::RunningQuery, TurnPhase::Deciding)
                | (TurnPhase::RunningComputation, TurnPhase::Deciding)
                | (TurnPhase::Explaining, TurnPhase::Deciding)
                | (TurnPhase::Synthesizing, TurnPhase::Finished)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnPhase::AwaitingClarification | TurnPhase::Finished)
    }
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnPhase::Deciding => write!(f, "deciding"),
            TurnPhase::RunningQuery => write!(f, "running_query"),
            TurnPhase::RunningComputation => write!(f, "running_computation"),
            TurnPhase::Explaining => write!(f, "explaining"),
            TurnPhase::AwaitingClarification => write!(f, "awaiting_clarification"),
            TurnPhase::Synthesizing => write!(f, "synthesizing"),
            TurnPhase::Finished => write!(f, "finished"),
        }
    }
}

/// One user turn as submitted to the loop. Clarification answers carry the
/// user's replies to earlier `ask_user` stops, keyed by request id.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub query: String,
    pub clarification_answers: BTreeMap<String, String>,
}

impl TurnRequest {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            clarification_answers: BTreeMap::new(),
        }
    }

    pub fn with_answer(mut self, id: &str, answer: &str) -> Self {
        self.clarification_answers
            .insert(id.to_string(), answer.to_string());
        self
    }
}

fn advance(
    phase: &mut TurnPhase,
    next: TurnPhase,
    cache_dir: &std::path::Path,
    loop_count: u32,
) {
    debug_assert!(phase.can_transition_to(next));
    let _ = append_agent_log_line(
        cache_dir,
        &format!("[turn] phase {phase} -> {next} loop_count={loop_count}"),
    );
    *phase = next;
}

/// Runs one full turn to a terminal state: either a final answer or a
/// clarification request the caller must relay to the user. Context loading is
/// the only fallible stage; executor and oracle faults are absorbed into step
/// results and re-planned around.
pub fn run_turn(
    request: &TurnRequest,
    oracle: &dyn Oracle,
    config: &AgentConfig,
) -> Result<SessionState, ContextError> {
    let schema = load_database_schema(&config.db_path)?;
    let (knowledge_text, knowledge_index) = load_markdown_knowledge(&config.docs_path)?;
    let mut state = SessionState::new(
        &request.query,
        schema,
        knowledge_text,
        knowledge_index,
        request.clarification_answers.clone(),
    );
    let _ = append_agent_log_line(
        &config.cache_dir,
        &format!("[turn] start query={:?}", request.query),
    );

    let mut phase = TurnPhase::Deciding;
    while !phase.is_terminal() {
        let action = supervisor::decide(&mut state, oracle, config);
        state.pending_action = Some(action.clone());

        match action.kind() {
            ActionKind::QueryAnalysis => {
                advance(&mut phase, TurnPhase::RunningQuery, &config.cache_dir, state.loop_count);
                analyst::run_query_step(&mut state, &action, oracle, config);
                state.pending_action = None;
                advance(&mut phase, TurnPhase::Deciding, &config.cache_dir, state.loop_count);
            }
            ActionKind::ComputationAnalysis => {
                advance(
                    &mut phase,
                    TurnPhase::RunningComputation,
                    &config.cache_dir,
                    state.loop_count,
                );
                analyst::run_computation_step(&mut state, &action, oracle, config);
                state.pending_action = None;
                advance(&mut phase, TurnPhase::Deciding, &config.cache_dir, state.loop_count);
            }
            ActionKind::KnowledgeExplain => {
                advance(&mut phase, TurnPhase::Explaining, &config.cache_dir, state.loop_count);
                // The returned proposal reaches the planner through the step
                // summary; routing stays with the next decision.
                let _proposed = expert::run_knowledge_step(&mut state, &action, oracle, config);
                state.pending_action = None;
                advance(&mut phase, TurnPhase::Deciding, &config.cache_dir, state.loop_count);
            }
            ActionKind::AskUser => {
                state.pending_action = None;
                advance(
                    &mut phase,
                    TurnPhase::AwaitingClarification,
                    &config.cache_dir,
                    state.loop_count,
                );
            }
            ActionKind::Finish => {
                advance(&mut phase, TurnPhase::Synthesizing, &config.cache_dir, state.loop_count);
                let note = match &action {
                    Action::Finish { description, .. } if !description.is_empty() => {
                        description.clone()
                    }
                    _ => "All planned analysis is complete.".to_string(),
                };
                synthesizer::synthesize(&mut state, oracle, config, &note);
                state.pending_action = None;
                state.pending_clarification = None;
                advance(&mut phase, TurnPhase::Finished, &config.cache_dir, state.loop_count);
            }
        }
    }

    let _ = append_agent_log_line(
        &config.cache_dir,
        &format!(
            "[turn] done phase={phase} steps={} loop_count={}",
            state.step_results.len(),
            state.loop_count
        ),
    );
    Ok(state)
}
