//! Process execution for commands.
//!
//! - [`ProcessRunner`]: spawns one supervised process per execution, captures
//!   combined output and kills process groups on stop
//! - [`ProcessCommandHandler`]: the stock [`CommandHandler`](crate::command::CommandHandler)
//!   that maps process exits onto command results
//!
//! # Exit codes
//!
//! `0` is success and anything else is failure, except for two sentinels that
//! no real process produces: [`EXIT_STOPPED`] after a stop request and
//! [`EXIT_SPAWN_FAILED`] when the process never started.
//!
//! # Security Note
//!
//! Commands run with the agent's own privileges and without sandboxing.

pub mod handler;
pub mod process;

pub use handler::ProcessCommandHandler;
pub use process::{ExitKind, ProcessOutput, ProcessRunner, EXIT_SPAWN_FAILED, EXIT_STOPPED};
