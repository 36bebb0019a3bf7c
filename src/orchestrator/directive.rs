//! 指令解析：从思考者原始输出中提取 execute / finish 指令
//!
//! 解析流水线按序尝试：剥离代码围栏 → 大括号子串扫描 → 截断 finish 补救。
//! 所有阶段以显式 Result 返回，解析失败与 schema 校验失败分开：前者允许一次
//! 重新提示，后者直接中止 Run。

use serde::{Deserialize, Serialize};

use crate::core::HiveError;

/// 重新提示时附加的指令（只允许一次）
pub const REPROMPT_SUFFIX: &str = "IMPORTANT: Respond with ONLY a JSON object, no other text.";

/// 截断补救中可接受的最短答案长度
const MIN_SALVAGED_ANSWER_CHARS: usize = 10;

/// 指令中的单个任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveTask {
    pub id: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// 思考者发出的结构化指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// 并行派发一批任务
    Execute { tasks: Vec<DirectiveTask> },
    /// 产出最终答案并结束
    Finish { answer: String },
}

/// 解析失败的分类：NoJson / InvalidJson 可重新提示一次，Invalid 直接中止
#[derive(Debug)]
pub enum DirectiveParseError {
    /// 文本中找不到 JSON 对象
    NoJson,
    /// 找到疑似 JSON 但无法解析，补救也失败
    InvalidJson(String),
    /// JSON 合法但违反 schema
    Invalid(HiveError),
}

impl DirectiveParseError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, DirectiveParseError::Invalid(_))
    }

    /// 终局失败时转换为 Run 级错误，保留触发的是哪一类
    pub fn into_hive_error(self) -> HiveError {
        match self {
            DirectiveParseError::NoJson => {
                HiveError::Parse("no JSON object in thinker output".to_string())
            }
            DirectiveParseError::InvalidJson(detail) => {
                HiveError::Parse(format!("invalid JSON in thinker output: {}", detail))
            }
            DirectiveParseError::Invalid(e) => e,
        }
    }
}

/// 解析思考者输出为指令
pub fn parse_directive(raw: &str) -> Result<Directive, DirectiveParseError> {
    let trimmed = raw.trim();

    // 阶段 1：剥离 ``` / ```json 围栏后直接解析
    let unfenced = strip_fences(trimmed);
    let mut last_json_err: Option<String> = None;
    match serde_json::from_str::<serde_json::Value>(unfenced) {
        Ok(value) => return validate(value).map_err(DirectiveParseError::Invalid),
        Err(e) => last_json_err = Some(e.to_string()),
    }

    // 阶段 2：取第一个 `{` 到最后一个 `}` 的子串
    if let Some(candidate) = brace_substring(trimmed) {
        match serde_json::from_str::<serde_json::Value>(candidate) {
            Ok(value) => return validate(value).map_err(DirectiveParseError::Invalid),
            Err(e) => last_json_err = Some(e.to_string()),
        }
    } else if !unfenced.contains('{') {
        return Err(DirectiveParseError::NoJson);
    }

    // 阶段 3：截断 finish 补救
    if let Some(answer) = salvage_truncated_finish(trimmed) {
        return Ok(Directive::Finish { answer });
    }

    Err(DirectiveParseError::InvalidJson(
        last_json_err.unwrap_or_else(|| "unparseable".to_string()),
    ))
}

fn strip_fences(s: &str) -> &str {
    let t = s.trim();
    let t = t
        .strip_prefix("```json")
        .or_else(|| t.strip_prefix("```"))
        .unwrap_or(t);
    let t = t.trim();
    let t = t.strip_suffix("```").unwrap_or(t);
    t.trim()
}

fn brace_substring(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end > start {
        Some(&s[start..=end])
    } else {
        None
    }
}

/// 截断 finish 补救：输出以 `"action":"finish"` 开头但答案字符串未闭合时，
/// 提取 `"answer":"` 之后的内容，剥掉尾部噪声并反转义。
pub fn salvage_truncated_finish(raw: &str) -> Option<String> {
    let finish_re = regex::Regex::new(r#""action"\s*:\s*"finish""#).ok()?;
    if !finish_re.is_match(raw) {
        return None;
    }

    let answer_re = regex::Regex::new(r#""answer"\s*:\s*""#).ok()?;
    let m = answer_re.find(raw)?;
    let tail = &raw[m.end()..];

    // 尾部噪声：收尾引号、右大括号、反引号与空白
    let cleaned = tail.trim_end_matches(|c: char| {
        c == '"' || c == '}' || c == '`' || c.is_whitespace()
    });

    let unescaped = cleaned
        .replace("\\n", "\n")
        .replace("\\\"", "\"")
        .replace("\\\\", "\\");

    if unescaped.chars().count() >= MIN_SALVAGED_ANSWER_CHARS {
        Some(unescaped)
    } else {
        None
    }
}

/// schema 校验：action 枚举、execute 的任务列表、finish 的答案
fn validate(value: serde_json::Value) -> Result<Directive, HiveError> {
    let action = value
        .get("action")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| {
            value
                .get("action")
                .map(|v| v.to_string())
                .unwrap_or_default()
        });

    match action.as_str() {
        "execute" => {
            let tasks = value
                .get("tasks")
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    HiveError::Validation("Execute directive has no tasks".to_string())
                })?;
            if tasks.is_empty() {
                return Err(HiveError::Validation(
                    "Execute directive has no tasks".to_string(),
                ));
            }

            let mut parsed = Vec::with_capacity(tasks.len());
            for (i, t) in tasks.iter().enumerate() {
                let id = t
                    .get("id")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        HiveError::Validation(format!("Task {} has no id", i))
                    })?;
                let task = t
                    .get("task")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        HiveError::Validation(format!("Task '{}' has no task text", id))
                    })?;
                let agent = t
                    .get("agent")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(String::from);
                parsed.push(DirectiveTask {
                    id: id.to_string(),
                    task: task.to_string(),
                    agent,
                });
            }
            Ok(Directive::Execute { tasks: parsed })
        }
        "finish" => {
            let answer = value
                .get("answer")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    HiveError::Validation("Finish directive has no answer".to_string())
                })?;
            Ok(Directive::Finish {
                answer: answer.to_string(),
            })
        }
        other => Err(HiveError::Validation(format!(
            "Unknown orchestrator action: {}",
            other
        ))),
    }
}
