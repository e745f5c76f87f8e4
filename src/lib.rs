pub mod agent;
pub mod cli;
pub mod commands;
pub mod compute;
pub mod config;
pub mod context;
pub mod oracle;
pub mod query;
pub mod session;
pub mod shared;
