//! Scanflow Orchestrator - keyed task graphs and their execution
//!
//! A [`GraphBuilder`] expands logical nodes over iteration sources into one
//! replica per key, joins replica outputs back into keyed collections, and
//! hands the instantiated [`TaskGraph`] to the admission-controlled
//! [`Scheduler`]. [`Pipeline`] assembles the preprocessing graph for a
//! discovered dataset.

pub mod budget;
pub mod graph;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod tasks;

pub use budget::{Admission, BudgetLedger};
pub use graph::{
    to_value, FnTask, GraphBuilder, NodeInputs, NodeOutputs, Scope, Task, TaskGraph, JOIN_OUTPUT,
};
pub use pipeline::Pipeline;
pub use report::{FailureRecord, OutputRecord, RunReport, SkippedRecord};
pub use scheduler::Scheduler;
