use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    QueryAnalysis,
    ComputationAnalysis,
    KnowledgeExplain,
    AskUser,
    Finish,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::QueryAnalysis => write!(f, "query_analysis"),
            ActionKind::ComputationAnalysis => write!(f, "computation_analysis"),
            ActionKind::KnowledgeExplain => write!(f, "knowledge_explain"),
            ActionKind::AskUser => write!(f, "ask_user"),
            ActionKind::Finish => write!(f, "finish"),
        }
    }
}

/// One planning decision. The supervisor oracle returns these as JSON tagged by
/// `action_type`; undecodable output is downgraded to `finish` by the decision
/// engine rather than surfacing a fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum Action {
    QueryAnalysis {
        #[serde(default)]
        id: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        tables: Vec<String>,
        #[serde(default)]
        target_artifact_id: Option<String>,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        date_from: Option<String>,
        #[serde(default)]
        date_to: Option<String>,
    },
    ComputationAnalysis {
        #[serde(default)]
        id: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        tables: Vec<String>,
        #[serde(default)]
        target_artifact_id: Option<String>,
    },
    KnowledgeExplain {
        #[serde(default)]
        id: String,
        #[serde(default)]
        description: String,
    },
    AskUser {
        #[serde(default)]
        id: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        clarification_question: Option<String>,
    },
    Finish {
        #[serde(default)]
        id: String,
        #[serde(default)]
        description: String,
    },
}

impl Action {
    pub fn finish(id: &str, description: impl Into<String>) -> Self {
        Action::Finish {
            id: id.to_string(),
            description: description.into(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::QueryAnalysis { .. } => ActionKind::QueryAnalysis,
            Action::ComputationAnalysis { .. } => ActionKind::ComputationAnalysis,
            Action::KnowledgeExplain { .. } => ActionKind::KnowledgeExplain,
            Action::AskUser { .. } => ActionKind::AskUser,
            Action::Finish { .. } => ActionKind::Finish,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Action::QueryAnalysis { id, .. }
            | Action::ComputationAnalysis { id, .. }
            | Action::KnowledgeExplain { id, .. }
            | Action::AskUser { id, .. }
            | Action::Finish { id, .. } => id,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Action::QueryAnalysis { description, .. }
            | Action::ComputationAnalysis { description, .. }
            | Action::KnowledgeExplain { description, .. }
            | Action::AskUser { description, .. }
            | Action::Finish { description, .. } => description,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    QueryAnalysis,
    ComputationAnalysis,
    KnowledgeExplain,
    AskUser,
    Finish,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::QueryAnalysis => write!(f, "query_analysis"),
            StepKind::ComputationAnalysis => write!(f, "computation_analysis"),
            StepKind::KnowledgeExplain => write!(f, "knowledge_explain"),
            StepKind::AskUser => write!(f, "ask_user"),
            StepKind::Finish => write!(f, "finish"),
        }
    }
}

impl From<ActionKind> for StepKind {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::QueryAnalysis => StepKind::QueryAnalysis,
            ActionKind::ComputationAnalysis => StepKind::ComputationAnalysis,
            ActionKind::KnowledgeExplain => StepKind::KnowledgeExplain,
            ActionKind::AskUser => StepKind::AskUser,
            ActionKind::Finish => StepKind::Finish,
        }
    }
}

/// Outcome of one executed step. A populated `error` makes the step a failure;
/// success payloads and `error` are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub kind: StepKind,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plots: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_tables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn new(step_id: &str, kind: StepKind, summary: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            kind,
            summary: summary.into(),
            artifact_id: None,
            artifact_path: None,
            metrics: None,
            plots: None,
            narrative: None,
            used_tables: None,
            error: None,
        }
    }

    pub fn status(&self) -> &'static str {
        if self.error.is_some() {
            "error"
        } else {
            "ok"
        }
    }
}

/// A persisted, immutable query result set. Created only by the query
/// executor; the computation executor references artifacts by id and never
/// mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataArtifact {
    pub artifact_id: String,
    pub csv_path: String,
    pub row_count: usize,
    pub columns: Vec<String>,
    #[serde(default)]
    pub sample_preview: Vec<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub id: String,
    pub question: String,
}

/// Mutable state for one user turn, owned exclusively by the orchestration
/// loop. `step_results` is append-only; insertion order is causal order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub user_query: String,
    pub schema_snapshot: DatabaseSchema,
    pub knowledge_text: String,
    pub knowledge_index: BTreeMap<String, String>,
    #[serde(default)]
    pub pending_action: Option<Action>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub data_artifacts: BTreeMap<String, DataArtifact>,
    #[serde(default)]
    pub pending_clarification: Option<ClarificationRequest>,
    #[serde(default)]
    pub clarification_answers: BTreeMap<String, String>,
    #[serde(default)]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub loop_count: u32,
}

impl SessionState {
    pub fn new(
        user_query: &str,
        schema_snapshot: DatabaseSchema,
        knowledge_text: String,
        knowledge_index: BTreeMap<String, String>,
        clarification_answers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            user_query: user_query.to_string(),
            schema_snapshot,
            knowledge_text,
            knowledge_index,
            pending_action: None,
            step_results: Vec::new(),
            data_artifacts: BTreeMap::new(),
            pending_clarification: None,
            clarification_answers,
            final_answer: None,
            loop_count: 0,
        }
    }

    pub fn record_step(&mut self, step: StepResult) {
        self.step_results.push(step);
    }

    pub fn insert_artifact(&mut self, artifact: DataArtifact) -> Result<(), String> {
        if self.data_artifacts.contains_key(&artifact.artifact_id) {
            return Err(format!(
                "artifact id `{}` already exists in this session",
                artifact.artifact_id
            ));
        }
        self.data_artifacts
            .insert(artifact.artifact_id.clone(), artifact);
        Ok(())
    }

    /// Dataset-name to csv-path view consumed by the computation executor.
    pub fn artifact_paths(&self) -> BTreeMap<String, String> {
        self.data_artifacts
            .iter()
            .map(|(id, artifact)| (id.clone(), artifact.csv_path.clone()))
            .collect()
    }

    pub fn recent_results(&self, window: usize) -> &[StepResult] {
        let start = self.step_results.len().saturating_sub(window);
        &self.step_results[start..]
    }

    pub fn is_terminal(&self) -> bool {
        self.final_answer.is_some() || self.pending_clarification.is_some()
    }
}
