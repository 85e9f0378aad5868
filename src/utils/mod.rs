//! Utilities
//!
//! Bounded output collection for helper processes.

pub mod output;
