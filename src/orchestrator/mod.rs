//! 编排层：指令解析、上下文组装、Step 派发、主循环与过程事件

pub mod context;
pub mod dag;
pub mod directive;
pub mod events;
pub mod loop_;
pub mod step;

pub use context::build_context;
pub use dag::{DagTask, TaskGraph};
pub use directive::{parse_directive, Directive, DirectiveTask};
pub use events::{EventSender, RunEvent};
pub use loop_::{Orchestrator, RunOptions, NO_RESULTS_ANSWER};
pub use step::{execute_step, StepLimits};
