pub mod archive;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod console;
pub mod console_log;
pub mod error;
pub mod error_payload;
pub mod event_bus;
pub mod fsutil;
pub mod http;
pub mod instance;
pub mod orchestrator;
pub mod properties;
pub mod registry;
pub mod resources;
pub mod scheduler;
pub mod state_machine;
pub mod supervisor;
pub mod uploads;
pub mod worlds;

pub use error::{AnvilError, Result};
pub use orchestrator::Orchestrator;
