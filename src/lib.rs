pub mod command;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod server;
pub mod shutdown;
pub mod worker;
