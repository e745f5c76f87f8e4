use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn agent_log_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join("logs/agent.log")
}

/// Appends one timestamped line to the session log. Logging failures are the
/// caller's concern; the analysis loop treats them as non-fatal.
pub fn append_agent_log_line(cache_dir: &Path, line: &str) -> std::io::Result<()> {
    let path = agent_log_path(cache_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    writeln!(file, "{stamp} {line}")
}
