//! Subprocess abstraction layer for driving the external assistant CLI.
//!
//! [`assistant::AssistantProcess`] is the interactive, long-running handle
//! the Iteration Runner drives: concurrent stdout/stderr consumption, plus
//! mid-run stdin writes for the `/compact` recovery ladder.

pub mod assistant;
pub mod error;
pub mod runner;

pub use assistant::{AssistantInvocation, AssistantProcess, StreamChunk, StreamSource};
pub use error::ProcessError;
pub use runner::ExitStatus;
