use crate::agent::{run_turn, TurnRequest};
use crate::config::{AgentConfig, ConfigError, CONFIG_PATH_ENV, DEFAULT_CONFIG_FILE};
use crate::context::{load_database_schema, load_markdown_knowledge};
use crate::oracle::{HttpOracle, Oracle};
use crate::session::SessionState;
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn help_text() -> String {
    [
        "Usage: fabsight <command> [args]",
        "",
        "Commands:",
        "  ask <question> [--answer id=value]...  run one analysis turn",
        "  schema                                 show the inspection database schema",
        "  knowledge                              show the Markdown knowledge index",
        "  version                                print the version",
        "  help                                   print this help",
        "",
        "Config file: fabsight.yaml (override with FABSIGHT_CONFIG).",
        "Environment overrides: FABSIGHT_DB_PATH, FABSIGHT_DOCS_PATH,",
        "FABSIGHT_CACHE_DIR, FABSIGHT_MODEL, FABSIGHT_API_BASE,",
        "FABSIGHT_MAX_QUERY_ROWS, FABSIGHT_LOOP_BOUND.",
    ]
    .join("\n")
}

fn map_config_err(err: ConfigError) -> String {
    err.to_string()
}

fn load_config() -> Result<AgentConfig, String> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    AgentConfig::load(Some(&path)).map_err(map_config_err)
}

/// Parses `ask` arguments: free words form the question, repeated
/// `--answer id=value` flags carry clarification replies.
fn parse_ask_args(args: &[String]) -> Result<TurnRequest, String> {
    let mut words: Vec<&str> = Vec::new();
    let mut request = TurnRequest::new("");
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--answer" {
            let pair = iter
                .next()
                .ok_or("--answer requires an id=value argument")?;
            let (id, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("--answer expects id=value, got `{pair}`"))?;
            if id.trim().is_empty() {
                return Err(format!("--answer expects id=value, got `{pair}`"));
            }
            request
                .clarification_answers
                .insert(id.trim().to_string(), value.trim().to_string());
        } else {
            words.push(arg.as_str());
        }
    }
    if words.is_empty() {
        return Err("ask requires a question".to_string());
    }
    request.query = words.join(" ");
    Ok(request)
}

/// Renders a terminal session state: either the final answer, or the
/// clarification the user must reply to via `--answer`.
pub fn render_turn(state: &SessionState) -> String {
    if let Some(clarification) = &state.pending_clarification {
        return format!(
            "Clarification needed [{}]: {}\nReply with: fabsight ask \"...\" --answer {}=<value>",
            clarification.id, clarification.question, clarification.id
        );
    }
    let mut out = state
        .final_answer
        .clone()
        .unwrap_or_else(|| "No answer was produced.".to_string());
    let artifacts: Vec<String> = state
        .data_artifacts
        .values()
        .map(|artifact| format!("  {} ({} rows) {}", artifact.artifact_id, artifact.row_count, artifact.csv_path))
        .collect();
    if !artifacts.is_empty() {
        out.push_str("\n\nSaved datasets:\n");
        out.push_str(&artifacts.join("\n"));
    }
    out
}

fn cmd_ask_with(args: &[String], oracle: &dyn Oracle, config: &AgentConfig) -> Result<String, String> {
    let request = parse_ask_args(args)?;
    config.ensure_cache_dir().map_err(map_config_err)?;
    let state = run_turn(&request, oracle, config).map_err(|err| err.to_string())?;
    Ok(render_turn(&state))
}

fn cmd_ask(args: &[String]) -> Result<String, String> {
    let config = load_config()?;
    let oracle = HttpOracle::new(&config.api_base, &config.model, config.api_key());
    cmd_ask_with(args, &oracle, &config)
}

fn cmd_schema() -> Result<String, String> {
    let config = load_config()?;
    let schema = load_database_schema(&config.db_path).map_err(|err| err.to_string())?;
    if schema.tables.is_empty() {
        return Ok(format!(
            "No tables found at {}.",
            config.db_path.display()
        ));
    }
    let mut lines = Vec::new();
    for table in &schema.tables {
        lines.push(format!("{}:", table.name));
        for column in &table.columns {
            let mut flags = Vec::new();
            if column.primary_key {
                flags.push("pk");
            }
            if column.not_null {
                flags.push("not null");
            }
            let suffix = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            lines.push(format!("  {} {}{}", column.name, column.data_type, suffix));
        }
    }
    Ok(lines.join("\n"))
}

fn cmd_knowledge() -> Result<String, String> {
    let config = load_config()?;
    let (text, index) = load_markdown_knowledge(&config.docs_path).map_err(|err| err.to_string())?;
    if text.is_empty() {
        return Ok(format!(
            "No Markdown knowledge found under {}.",
            config.docs_path.display()
        ));
    }
    let mut lines = vec![format!(
        "Loaded {} characters of knowledge from {}.",
        text.chars().count(),
        config.docs_path.display()
    )];
    if !index.is_empty() {
        lines.push("Indexed tables:".to_string());
        for table in index.keys() {
            lines.push(format!("  {table}"));
        }
    }
    Ok(lines.join("\n"))
}

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }
    match args[0].as_str() {
        "ask" => cmd_ask(&args[1..]),
        "schema" => cmd_schema(),
        "knowledge" => cmd_knowledge(),
        "version" => Ok(format!("fabsight {VERSION}")),
        "help" | "--help" | "-h" => Ok(help_text()),
        other => Err(format!("unknown command `{other}`")),
    }
}
