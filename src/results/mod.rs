//! Evaluation results and their on-disk layout.
//!
//! ```text
//! {result_dir}/result.json            manifest
//! {result_dir}/{id}/{test}.{role}     actual output
//! {result_dir}/{id}/{test}.{role}.expected
//! {result_dir}/{id}/{test}.diff.{role}
//! {result_dir}/{id}/{test}.html.{role}
//! ```

pub mod html;
pub mod store;
pub mod types;

pub use store::{load_manifest, ResultStore, MANIFEST_FILE};
pub use types::{
    is_truthy, Comment, EvaluationResult, FileResult, Metadata, PipeResult, TestResult,
};
