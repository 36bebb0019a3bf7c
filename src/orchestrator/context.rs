//! 思考上下文组装
//!
//! system 提示（含智能体花名册与指令 JSON 格式）+ Goal + 已累积的各 Step 任务输出转写；
//! 单条输出超过 output_truncation 字符时截断并加标记。

use crate::agents::AgentInfo;
use crate::run::{Step, TaskState};

/// 单条任务输出默认截断长度（字符）
pub const DEFAULT_OUTPUT_TRUNCATION: usize = 3000;

const TRUNCATION_MARKER: &str = "…(truncated)";

/// 组装一次 Think 的完整上下文
pub fn build_context(
    goal: &str,
    steps: &[Step],
    roster: &[AgentInfo],
    output_truncation: usize,
) -> String {
    let mut out = String::new();
    out.push_str(&system_prompt(roster));
    out.push_str("\n\nGoal: ");
    out.push_str(goal);

    if !steps.is_empty() {
        out.push_str("\n\nResults so far:\n");
        for step in steps {
            out.push_str(&format!("\n### Step {}\n", step.step_number));
            for task in &step.tasks {
                let status = match task.status {
                    TaskState::Done => "done",
                    TaskState::Failed => "failed",
                    TaskState::Running => "running",
                    TaskState::Pending => "pending",
                };
                out.push_str(&format!("- [{}] {} ({}): ", task.id, status, task.task));
                match &task.result {
                    Some(result) => out.push_str(&truncate_output(&result.output, output_truncation)),
                    None => out.push_str("(no output)"),
                }
                out.push('\n');
            }
        }
    }

    out
}

/// system 提示：角色说明 + 花名册 + 指令 JSON 格式
fn system_prompt(roster: &[AgentInfo]) -> String {
    let mut prompt = String::from(
        "You are an orchestrator coordinating a pool of specialized agents to \
accomplish a goal. Each turn, review the goal and all results so far, then \
respond with EXACTLY ONE JSON object, no other text.\n\n\
To dispatch tasks in parallel:\n\
{\"action\":\"execute\",\"tasks\":[{\"id\":\"t1\",\"task\":\"<prompt>\",\"agent\":\"<name or capability, optional>\"}]}\n\n\
To deliver the final answer when the goal is achieved:\n\
{\"action\":\"finish\",\"answer\":\"<synthesized answer>\"}\n",
    );

    if roster.is_empty() {
        prompt.push_str("\nNo specialized agents are registered; tasks run on the default executor.\n");
    } else {
        prompt.push_str("\nAvailable agents:\n");
        for agent in roster {
            prompt.push_str(&format!("- {}", agent.name));
            if let Some(desc) = &agent.description {
                prompt.push_str(&format!(": {}", desc));
            }
            if !agent.capabilities.is_empty() {
                prompt.push_str(&format!(" [{}]", agent.capabilities.join(", ")));
            }
            prompt.push('\n');
        }
    }

    prompt
}

fn truncate_output(output: &str, limit: usize) -> String {
    let chars: Vec<char> = output.chars().collect();
    if chars.len() <= limit {
        output.to_string()
    } else {
        let mut truncated: String = chars[..limit].iter().collect();
        truncated.push_str(TRUNCATION_MARKER);
        truncated
    }
}
