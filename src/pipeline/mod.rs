//! Evaluation pipeline: typed steps, their registry and the sequential runner.
//!
//! A task's `pipeline:` list is resolved by [`registry::StepRegistry`] into
//! [`PipeSpec`]s. [`runner::evaluate`] executes them in order against one
//! sandbox and records a [`crate::results::PipeResult`] per executed step.

pub mod build;
pub mod commands;
pub mod container;
pub mod diagnostics;
pub mod fault_injection;
pub mod input_generator;
pub mod progress;
pub mod registry;
pub mod runner;

use crate::config::types::ExecutionLimits;
use crate::results::{is_truthy, Metadata};
use serde::{Deserialize, Serialize};

pub use build::BuildParams;
pub use commands::CommandsParams;
pub use container::ContainerParams;
pub use fault_injection::FaultInjectionParams;
pub use input_generator::InputGeneratorParams;
pub use progress::JobStatus;
pub use run_tests::RunTestsParams;

/// `enabled:` of a step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enabled {
    #[default]
    Always,
    Never,
    /// Only when the run's metadata carries a truthy `announce`
    OnAnnouncement,
}

impl Enabled {
    pub fn is_active(&self, metadata: &Metadata) -> bool {
        match self {
            Enabled::Always => true,
            Enabled::Never => false,
            Enabled::OnAnnouncement => metadata
                .get("announce")
                .map(|v| is_truthy(v))
                .unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipeKind {
    Build(BuildParams),
    RunTests(RunTestsParams),
    RunCommands(CommandsParams),
    FaultInjection(FaultInjectionParams),
    InputGenerator(InputGeneratorParams),
    ContainerDelegate(ContainerParams),
}

impl PipeKind {
    /// Whether a failure of this kind stops the pipeline unless configured otherwise
    pub fn default_fail_on_error(&self) -> bool {
        matches!(self, PipeKind::Build(_) | PipeKind::RunCommands(_))
    }

    pub fn default_title(&self, type_name: &str) -> String {
        match self {
            PipeKind::Build(_) => "Compilation".to_string(),
            PipeKind::RunTests(_) => "Tests".to_string(),
            PipeKind::RunCommands(_) => "Commands".to_string(),
            PipeKind::FaultInjection(_) => "Allocation failure tests".to_string(),
            PipeKind::InputGenerator(_) => "Generated tests".to_string(),
            PipeKind::ContainerDelegate(_) => type_name.to_string(),
        }
    }
}

/// One resolved pipeline step
#[derive(Clone, Debug, PartialEq)]
pub struct PipeSpec {
    /// Position in the pipeline, starting at 1; names the artifact directory
    pub id: usize,
    /// `type:` as written in the config
    pub type_name: String,
    pub title: String,
    pub enabled: Enabled,
    /// Whether a failing run of this step reports `failed` and so stops the pipeline
    pub fail_on_error: bool,
    /// Step level `limits:` override
    pub limits: Option<ExecutionLimits>,
    pub kind: PipeKind,
}
