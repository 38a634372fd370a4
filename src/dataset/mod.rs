//! Paper and task registry.
//!
//! In-memory representation of papers and their tasks, loaded from
//! structured JSON specifications. Papers are treated as read-only once
//! loaded; schema violations (tolerance shape, duplicate ids, unknown
//! parents) are caught eagerly here, before any agent run is spent.

pub mod loader;
pub mod paper;
pub mod task;

pub use loader::{export_to_jsonl, from_jsonl, validate_paper, LoadReport, PaperLoader};
pub use paper::{DatasetDescriptor, DatasetKind, ExecutionRequirements, Paper};
pub use task::{Task, TaskKind};
