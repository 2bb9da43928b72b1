pub mod config;
pub mod controller;
pub mod dry_run;
pub mod error;
pub mod launcher;
pub mod log_mux;
pub mod log_reader;
pub mod runner;
pub mod store;

pub use config::AgentConfig;
pub use controller::JobController;
pub use error::{JobError, Result};
