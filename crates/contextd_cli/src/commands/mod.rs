//! CLI command implementations.

pub mod dump;
pub mod exec;
pub mod verify;
