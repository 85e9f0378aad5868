//! Task configuration
//!
//! Workflow parsing, the test catalog and shared types.

pub mod catalog;
pub mod types;
pub mod workflow;
