//! Run 数据模型与持久化

pub mod model;
pub mod store;

pub use model::{Run, RunState, Step, StepTask, TaskResult, TaskResultStatus, TaskState};
pub use store::{create_run_store, MemoryRunStore, RunStore};

#[cfg(feature = "async-sqlite")]
pub use store::SqliteRunStore;
