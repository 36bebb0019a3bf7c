//! 编排过程事件：用于回调与 SSE 展示
//!
//! 事件序列化后的 `type` 字段与仪表盘 SSE 报文一致（run:started、task:chunk 等）。
//! 每个 Step 的顺序保证：step:thinking → step:started →（该 Step 各任务的
//! task:started / task:chunk / task:ended 任意交错）→ step:ended。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::run::{TaskResult, TaskState};

/// 编排过程事件（可序列化为 JSON 供 SSE 订阅者消费）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run:started")]
    RunStarted {
        #[serde(rename = "runId")]
        run_id: String,
        goal: String,
    },
    #[serde(rename = "step:thinking")]
    StepThinking {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "stepNumber")]
        step_number: usize,
    },
    #[serde(rename = "step:started")]
    StepStarted {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "stepNumber")]
        step_number: usize,
        #[serde(rename = "taskIds")]
        task_ids: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tasks: Option<Vec<String>>,
    },
    #[serde(rename = "task:started")]
    TaskStarted {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "stepNumber")]
        step_number: usize,
        #[serde(rename = "taskId")]
        task_id: String,
    },
    #[serde(rename = "task:chunk")]
    TaskChunk {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "stepNumber")]
        step_number: usize,
        #[serde(rename = "taskId")]
        task_id: String,
        content: String,
        done: bool,
    },
    #[serde(rename = "task:ended")]
    TaskEnded {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "stepNumber")]
        step_number: usize,
        #[serde(rename = "taskId")]
        task_id: String,
        result: TaskResult,
        status: TaskState,
    },
    #[serde(rename = "step:ended")]
    StepEnded {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "stepNumber")]
        step_number: usize,
    },
    #[serde(rename = "run:complete")]
    RunComplete {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
        #[serde(rename = "durationMs")]
        duration_ms: i64,
    },
    #[serde(rename = "run:error")]
    RunError {
        #[serde(rename = "runId")]
        run_id: String,
        error: String,
    },
    #[serde(rename = "run:deleted")]
    RunDeleted {
        #[serde(rename = "runId")]
        run_id: String,
    },
}

/// 事件发送端（未接入前端时为 None）
pub type EventSender = mpsc::UnboundedSender<RunEvent>;

/// 向可选通道发送事件，接收端关闭时静默丢弃
pub fn send_event(tx: &Option<EventSender>, ev: RunEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
