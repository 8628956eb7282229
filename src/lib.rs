#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod clients;
pub mod config;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod util;

pub use pipeline::{
    CreationSpec, ProgressHub, ProgressSnapshot, StepProgress, Workflow, WorkflowBuilder,
    WorkflowError,
};
pub use store::models::{Book, BookStatus, BookType, GenerationTask, Stage, TaskStatus};
