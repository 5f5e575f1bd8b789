//! omc-bridge - Bridge daemon between team-lead task queues and AI coding CLIs

pub mod bridge;
pub mod config;
pub mod error;
pub mod fsio;
pub mod mailbox;
pub mod prompt;
pub mod provider;
pub mod sanitize;
pub mod signals;
pub mod subprocess;
pub mod tasks;
pub mod telemetry;
