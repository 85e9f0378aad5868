//! kelvin-eval: sandboxed evaluation of student submissions
//!
//! A task directory describes a pipeline of steps (build, tests, commands,
//! container tools, ...) plus a catalog of tests. The engine copies a
//! submission into a sandbox, runs the pipeline against it and writes a JSON
//! manifest with per-test artifacts into a result directory.
//!
//! # Layout
//!
//! ## Task configuration ([`config`])
//! - [`config::workflow`]: `config.yml` parsing and task loading
//! - [`config::catalog`]: tests from config, fixture files and scripts
//! - [`config::types`]: limits, engine settings and the crate error type
//!
//! ## Execution ([`sandbox`], [`pipeline`])
//! - [`sandbox`]: isolate and local backends behind one trait
//! - [`pipeline::registry`]: step types by name
//! - [`pipeline::runner`]: sequential pipeline and [`evaluate`]
//!
//! ## Results ([`compare`], [`results`])
//! - [`compare`]: text, binary and image comparators with filters
//! - [`results`]: typed results, html fragments and the manifest store
//!
//! ## Extensions ([`script`])
//! - [`script`]: out-of-process `generate_tests` / `check` hooks

// Task configuration
pub mod config;

// Isolation backends
pub mod sandbox;

// Pipeline steps and runner
pub mod pipeline;

// Output comparison
pub mod compare;

// Result model and storage
pub mod results;

// Task extension scripts
pub mod script;

// Filesystem safety helpers
pub mod safety;

// Utilities
pub mod utils;

// CLI entrypoint
pub mod cli;

pub use config::types::{EngineConfig, EvalError, ExecutionLimits, Result, SandboxKind};
pub use pipeline::runner::{evaluate, evaluate_with, EvaluationRequest};
pub use pipeline::JobStatus;
pub use results::{EvaluationResult, Metadata};
