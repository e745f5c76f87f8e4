pub mod analyst;
pub mod expert;
pub mod prompts;
pub mod supervisor;
pub mod synthesizer;
pub mod turn;

pub use turn::{run_turn, TurnPhase, TurnRequest};

/// How many trailing step results the planning and explanation prompts see.
pub const RESULT_WINDOW: usize = 5;

/// Knowledge text is truncated to this many characters before entering any
/// prompt.
pub const KNOWLEDGE_PROMPT_CHARS: usize = 4000;

/// Truncates on a character boundary so multi-byte content never splits.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
