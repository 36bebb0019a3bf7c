//! 编排主循环
//!
//! Think ↔ Execute 状态机：每轮把目标与已累积的任务输出交给思考者，得到
//! execute 则并行派发一批任务，得到 finish 则终止；步数耗尽时先强制要求
//! finish，再退化为应急合成。解析/校验错误中止 Run；任务失败只留在结果里，
//! 循环继续，下一轮思考者自会看到。

use std::sync::Arc;

use crate::agents::AgentRegistry;
use crate::core::HiveError;
use crate::orchestrator::context::{build_context, DEFAULT_OUTPUT_TRUNCATION};
use crate::orchestrator::directive::{parse_directive, Directive, REPROMPT_SUFFIX};
use crate::orchestrator::events::{send_event, EventSender, RunEvent};
use crate::observability::Metrics;
use crate::orchestrator::step::{execute_step, StepLimits};
use crate::run::{Run, RunState, Step, StepTask};
use crate::thinker::Thinker;

/// 应急合成在没有任何成功任务时的返回值
pub const NO_RESULTS_ANSWER: &str = "No results collected.";

/// 强制 finish 时附加的指令
const FORCE_FINISH_SUFFIX: &str = "You MUST respond with a finish action now.";

/// 一次 Run 的选项
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 单 Step 并发上限
    pub max_concurrency: usize,
    /// Think↔Execute 步数预算
    pub max_steps: usize,
    /// 上下文中单条任务输出的截断长度（字符）
    pub output_truncation: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_steps: 10,
            output_truncation: DEFAULT_OUTPUT_TRUNCATION,
        }
    }
}

/// 编排器：持有思考者、智能体注册表与派发点限流/缓存
pub struct Orchestrator {
    thinker: Arc<dyn Thinker>,
    agents: Arc<AgentRegistry>,
    limits: StepLimits,
}

impl Orchestrator {
    pub fn new(thinker: Arc<dyn Thinker>, agents: Arc<AgentRegistry>) -> Self {
        Self {
            thinker,
            agents,
            limits: StepLimits::default(),
        }
    }

    /// 配置派发点的限流与缓存
    pub fn with_limits(mut self, limits: StepLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    /// 单轮 Think，不执行：返回原始指令
    pub async fn plan(&self, goal: &str) -> Result<Directive, HiveError> {
        let roster = self.agents.roster().await;
        let context = build_context(goal, &[], &roster, DEFAULT_OUTPUT_TRUNCATION);
        self.think(&context).await
    }

    /// 执行一次 Run；终态的 Run 必有 final_answer 或 error
    pub async fn run(
        &self,
        goal: &str,
        options: RunOptions,
        event_tx: Option<EventSender>,
    ) -> Run {
        self.run_prepared(Run::new(goal), options, event_tx).await
    }

    /// 执行一个预建的 Run（调用方已分配 run_id，如仪表盘先应答再执行）
    pub async fn run_prepared(
        &self,
        mut run: Run,
        options: RunOptions,
        event_tx: Option<EventSender>,
    ) -> Run {
        let goal = run.goal.clone();
        let goal = goal.as_str();
        send_event(
            &event_tx,
            RunEvent::RunStarted {
                run_id: run.run_id.clone(),
                goal: run.goal.clone(),
            },
        );
        tracing::info!(run_id = %run.run_id, goal = %run.goal, "Run started");

        for step_number in 1..=options.max_steps {
            run.state = RunState::Thinking;
            send_event(
                &event_tx,
                RunEvent::StepThinking {
                    run_id: run.run_id.clone(),
                    step_number,
                },
            );

            let roster = self.agents.roster().await;
            let context = build_context(goal, &run.steps, &roster, options.output_truncation);

            let directive = match self.think(&context).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(run_id = %run.run_id, "Think failed: {}", e);
                    run.fail(e.to_string());
                    send_event(
                        &event_tx,
                        RunEvent::RunError {
                            run_id: run.run_id.clone(),
                            error: e.to_string(),
                        },
                    );
                    return run;
                }
            };

            match directive {
                Directive::Finish { answer } => {
                    run.complete(answer.clone());
                    send_event(
                        &event_tx,
                        RunEvent::RunComplete {
                            run_id: run.run_id.clone(),
                            answer: Some(answer),
                            duration_ms: run.duration_ms(),
                        },
                    );
                    tracing::info!(run_id = %run.run_id, steps = run.steps.len(), "Run finished");
                    return run;
                }
                Directive::Execute { tasks } => {
                    let step_tasks: Vec<StepTask> = tasks
                        .into_iter()
                        .map(|t| StepTask::new(t.id, t.task, t.agent))
                        .collect();
                    let mut step = Step {
                        step_number,
                        tasks: step_tasks,
                    };

                    run.state = RunState::Executing;
                    send_event(
                        &event_tx,
                        RunEvent::StepStarted {
                            run_id: run.run_id.clone(),
                            step_number,
                            task_ids: step.tasks.iter().map(|t| t.id.clone()).collect(),
                            tasks: Some(step.tasks.iter().map(|t| t.task.clone()).collect()),
                        },
                    );

                    execute_step(
                        &run.run_id,
                        &mut step,
                        &self.agents,
                        options.max_concurrency,
                        &self.limits,
                        &event_tx,
                    )
                    .await;

                    run.steps.push(step);
                    send_event(
                        &event_tx,
                        RunEvent::StepEnded {
                            run_id: run.run_id.clone(),
                            step_number,
                        },
                    );
                }
            }
        }

        // 步数耗尽：先强制 finish，再退化为应急合成
        tracing::info!(run_id = %run.run_id, "Step budget exhausted, forcing finish");
        run.state = RunState::Thinking;
        let roster = self.agents.roster().await;
        let context = build_context(goal, &run.steps, &roster, options.output_truncation);
        let forced = format!("{}\n\n{}", context, FORCE_FINISH_SUFFIX);

        let answer = match self.think(&forced).await {
            Ok(Directive::Finish { answer }) => answer,
            Ok(Directive::Execute { .. }) | Err(_) => emergency_synthesis(&run),
        };

        run.complete(answer.clone());
        send_event(
            &event_tx,
            RunEvent::RunComplete {
                run_id: run.run_id.clone(),
                answer: Some(answer),
                duration_ms: run.duration_ms(),
            },
        );
        run
    }

    /// Think：调思考者 → 解析；解析失败时附加提示恰好重试一次
    async fn think(&self, context: &str) -> Result<Directive, HiveError> {
        Metrics::global()
            .think_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let raw = self.thinker.think(context).await?;
        match parse_directive(&raw) {
            Ok(directive) => Ok(directive),
            Err(e) if e.is_retriable() => {
                tracing::debug!("Directive parse failed, re-prompting once");
                let retry_context = format!("{}\n\n{}", context, REPROMPT_SUFFIX);
                let raw = self.thinker.think(&retry_context).await?;
                parse_directive(&raw).map_err(|e| e.into_hive_error())
            }
            Err(e) => Err(e.into_hive_error()),
        }
    }
}

/// 应急合成：把所有成功任务的输出拼成 markdown 小节；一个都没有则返回固定文案
fn emergency_synthesis(run: &Run) -> String {
    let mut sections = Vec::new();
    for step in &run.steps {
        for task in &step.tasks {
            if let Some(result) = &task.result {
                if result.is_ok() {
                    sections.push(format!("## Task {}\n\n{}", task.id, result.output));
                }
            }
        }
    }
    if sections.is_empty() {
        NO_RESULTS_ANSWER.to_string()
    } else {
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::FunctionAdapter;
    use crate::run::TaskState;
    use crate::thinker::ScriptedThinker;

    async fn echo_registry() -> Arc<AgentRegistry> {
        let registry = Arc::new(AgentRegistry::new());
        registry
            .add(Arc::new(FunctionAdapter::new("echo", |t: String| async move {
                Ok(format!("Done: {}", t))
            })))
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_immediate_finish_has_zero_steps() {
        let thinker = Arc::new(ScriptedThinker::new(vec![
            r#"{"action":"finish","answer":"直接给出答案"}"#,
        ]));
        let orchestrator = Orchestrator::new(thinker, echo_registry().await);
        let run = orchestrator.run("goal", RunOptions::default(), None).await;

        assert_eq!(run.state, RunState::Done);
        assert!(run.steps.is_empty());
        assert_eq!(run.final_answer.as_deref(), Some("直接给出答案"));
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_execute_then_finish() {
        let thinker = Arc::new(ScriptedThinker::new(vec![
            r#"{"action":"execute","tasks":[{"id":"t1","task":"collect"}]}"#,
            r#"{"action":"finish","answer":"based on step 1"}"#,
        ]));
        let orchestrator = Orchestrator::new(thinker, echo_registry().await);
        let run = orchestrator.run("goal", RunOptions::default(), None).await;

        assert_eq!(run.state, RunState::Done);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].tasks[0].status, TaskState::Done);
        assert_eq!(run.final_answer.as_deref(), Some("based on step 1"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_all_failures_yields_no_results() {
        let thinker = Arc::new(ScriptedThinker::new(vec![
            r#"{"action":"execute","tasks":[{"id":"x","task":"do"}]}"#,
        ]));
        let registry = Arc::new(AgentRegistry::new());
        registry
            .add(Arc::new(FunctionAdapter::new("bad", |_: String| async move {
                Err("always fails".to_string())
            })))
            .await
            .unwrap();

        let options = RunOptions {
            max_steps: 1,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(thinker, registry);
        let run = orchestrator.run("goal", options, None).await;

        // 脚本思考者重复 execute，强制 finish 也得到 execute → 应急合成
        assert_eq!(run.state, RunState::Done);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.final_answer.as_deref(), Some(NO_RESULTS_ANSWER));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_synthesizes_done_outputs() {
        let thinker = Arc::new(ScriptedThinker::new(vec![
            r#"{"action":"execute","tasks":[{"id":"a","task":"first"}]}"#,
            r#"{"action":"execute","tasks":[{"id":"b","task":"second"}]}"#,
            r#"{"action":"execute","tasks":[{"id":"c","task":"third"}]}"#,
        ]));
        let options = RunOptions {
            max_steps: 2,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(thinker, echo_registry().await);
        let run = orchestrator.run("goal", options, None).await;

        assert_eq!(run.state, RunState::Done);
        assert_eq!(run.steps.len(), 2);
        let answer = run.final_answer.unwrap();
        assert!(answer.contains("## Task a"));
        assert!(answer.contains("Done: first"));
        assert!(answer.contains("## Task b"));
    }

    #[tokio::test]
    async fn test_validation_error_aborts_run() {
        let thinker = Arc::new(ScriptedThinker::new(vec![r#"{"action":"dance"}"#]));
        let orchestrator = Orchestrator::new(thinker, echo_registry().await);
        let run = orchestrator.run("goal", RunOptions::default(), None).await;

        assert_eq!(run.state, RunState::Error);
        assert!(run
            .error
            .as_deref()
            .unwrap()
            .contains("Unknown orchestrator action: dance"));
    }

    #[tokio::test]
    async fn test_reprompt_recovers_from_garbage() {
        let thinker = Arc::new(ScriptedThinker::new(vec![
            "total garbage, nothing structured",
            r#"{"action":"finish","answer":"after reprompt"}"#,
        ]));
        let orchestrator = Orchestrator::new(thinker, echo_registry().await);
        let run = orchestrator.run("goal", RunOptions::default(), None).await;

        assert_eq!(run.state, RunState::Done);
        assert_eq!(run.final_answer.as_deref(), Some("after reprompt"));
    }

    #[tokio::test]
    async fn test_plan_returns_raw_directive() {
        let thinker = Arc::new(ScriptedThinker::new(vec![
            r#"{"action":"execute","tasks":[{"id":"t","task":"x","agent":"coder"}]}"#,
        ]));
        let orchestrator = Orchestrator::new(thinker, echo_registry().await);
        match orchestrator.plan("goal").await.unwrap() {
            Directive::Execute { tasks } => {
                assert_eq!(tasks[0].agent.as_deref(), Some("coder"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_ordering_per_step() {
        let thinker = Arc::new(ScriptedThinker::new(vec![
            r#"{"action":"execute","tasks":[{"id":"t1","task":"x"},{"id":"t2","task":"y"}]}"#,
            r#"{"action":"finish","answer":"done now"}"#,
        ]));
        let orchestrator = Orchestrator::new(thinker, echo_registry().await);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _run = orchestrator.run("goal", RunOptions::default(), Some(tx)).await;

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(match ev {
                RunEvent::RunStarted { .. } => "run:started",
                RunEvent::StepThinking { .. } => "step:thinking",
                RunEvent::StepStarted { .. } => "step:started",
                RunEvent::TaskStarted { .. } => "task:started",
                RunEvent::TaskChunk { .. } => "task:chunk",
                RunEvent::TaskEnded { .. } => "task:ended",
                RunEvent::StepEnded { .. } => "step:ended",
                RunEvent::RunComplete { .. } => "run:complete",
                RunEvent::RunError { .. } => "run:error",
                RunEvent::RunDeleted { .. } => "run:deleted",
            });
        }

        assert_eq!(kinds.first(), Some(&"run:started"));
        assert_eq!(kinds.last(), Some(&"run:complete"));
        let step_started = kinds.iter().position(|k| *k == "step:started").unwrap();
        let step_ended = kinds.iter().position(|k| *k == "step:ended").unwrap();
        let thinking = kinds.iter().position(|k| *k == "step:thinking").unwrap();
        assert!(thinking < step_started);
        assert!(step_started < step_ended);
        // 任务事件都夹在 step:started 与 step:ended 之间
        for (i, k) in kinds.iter().enumerate() {
            if *k == "task:started" || *k == "task:ended" {
                assert!(i > step_started && i < step_ended);
            }
        }
    }
}
