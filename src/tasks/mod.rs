//! Tasks: the record type, command operations and reply rendering.

pub mod format;
pub mod model;
pub mod service;

pub use model::{Task, TaskFilter, TaskOrder, TaskPatch, TaskStatistics};
pub use service::TaskService;
