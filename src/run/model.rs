//! Run / Step / StepTask / TaskResult 数据模型
//!
//! Run 是一次目标执行的完整记录：在 thinking / executing 间交替，直到 done 或 error。
//! 字段序列化为 camelCase，与仪表盘及 SSE 报文保持一致。

use serde::{Deserialize, Serialize};

/// 单个任务执行结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResultStatus {
    /// 正常完成
    Ok,
    /// 执行出错
    Error,
    /// 超时
    Timeout,
}

/// 任务执行结果（不可变）：状态、输出文本与自由元数据（至少含 durationMs）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskResultStatus,
    pub output: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TaskResult {
    pub fn ok(output: impl Into<String>, duration_ms: u64) -> Self {
        Self::with_status(TaskResultStatus::Ok, output, duration_ms)
    }

    pub fn error(output: impl Into<String>, duration_ms: u64) -> Self {
        Self::with_status(TaskResultStatus::Error, output, duration_ms)
    }

    pub fn timeout(output: impl Into<String>, duration_ms: u64) -> Self {
        Self::with_status(TaskResultStatus::Timeout, output, duration_ms)
    }

    fn with_status(status: TaskResultStatus, output: impl Into<String>, duration_ms: u64) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("durationMs".to_string(), serde_json::json!(duration_ms));
        Self {
            status,
            output: output.into(),
            metadata,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == TaskResultStatus::Ok
    }
}

/// Step 内单个任务的状态
///
/// 单调推进：pending → running → done / failed；result 当且仅当终态存在。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

/// 一个 Step 中的任务单元
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTask {
    /// 由思考者指定，应在 Step 内唯一
    pub id: String,
    /// 任务提示词
    pub task: String,
    /// 可选路由提示：适配器名或能力标签
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl StepTask {
    pub fn new(id: impl Into<String>, task: impl Into<String>, agent: Option<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            agent,
            status: TaskState::Pending,
            result: None,
        }
    }

    /// 记录终态：ok → done，其余 → failed
    pub fn finish(&mut self, result: TaskResult) {
        self.status = if result.is_ok() {
            TaskState::Done
        } else {
            TaskState::Failed
        };
        self.result = Some(result);
    }
}

/// 一次并行派发的任务批次
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// 1 起始，Run 内严格递增
    pub step_number: usize,
    pub tasks: Vec<StepTask>,
}

/// Run 状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Thinking,
    Executing,
    Done,
    Error,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Error)
    }
}

/// 一次目标执行的完整记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,
    pub goal: String,
    pub state: RunState,
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 毫秒时间戳
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

impl Run {
    /// 以 thinking 状态创建新 Run
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            state: RunState::Thinking,
            steps: Vec::new(),
            final_answer: None,
            error: None,
            started_at: chrono::Utc::now().timestamp_millis(),
            finished_at: None,
        }
    }

    /// 终态转移：done，finishedAt 恰好设置一次
    pub fn complete(&mut self, answer: impl Into<String>) {
        self.state = RunState::Done;
        self.final_answer = Some(answer.into());
        if self.finished_at.is_none() {
            self.finished_at = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    /// 终态转移：error
    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = RunState::Error;
        self.error = Some(error.into());
        if self.finished_at.is_none() {
            self.finished_at = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
            - self.started_at
    }
}
