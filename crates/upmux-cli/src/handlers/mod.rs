//! Command handlers.
//!
//! Handlers are thin: they take the composed [`crate::CliContext`], call into
//! the runtime and format output for the terminal.

pub mod check;
pub mod login;
pub mod serve;
pub mod sweep;
