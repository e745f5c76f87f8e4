pub mod ids;
pub mod logging;

pub use ids::{new_artifact_id, new_plot_id, validate_identifier_value};
pub use logging::{agent_log_path, append_agent_log_line};
