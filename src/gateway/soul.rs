//! SOUL.md 解析：网关侧每个智能体的描述文档
//!
//! - 描述：第一个 H1 之后、下一个标题之前的第一行非空正文
//! - 能力：`## What You're Good At`（不区分大小写）标题下的列表项，slug 化
//! - 角色提示：整个文件内容，作为该智能体每个任务的前缀原样下发

use serde::Serialize;

/// SOUL.md 解析结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoulProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// 文件全文
    pub role_prompt: String,
}

/// 解析 SOUL.md 内容；确定性：同一输入恒得同一结果
pub fn parse_soul(content: &str) -> SoulProfile {
    let lines: Vec<&str> = content.lines().collect();

    let mut description = None;
    let mut seen_h1 = false;
    for line in &lines {
        let trimmed = line.trim();
        if !seen_h1 {
            if trimmed.starts_with("# ") {
                seen_h1 = true;
            }
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            break;
        }
        description = Some(trimmed.to_string());
        break;
    }

    let heading_re = regex::Regex::new(r"(?i)^##\s+What You're Good At").unwrap();
    let mut capabilities = Vec::new();
    let mut in_section = false;
    for line in &lines {
        let trimmed = line.trim();
        if heading_re.is_match(trimmed) {
            in_section = true;
            continue;
        }
        if in_section {
            if trimmed.starts_with('#') {
                break;
            }
            if let Some(bullet) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
                .or_else(|| trimmed.strip_prefix('-'))
                .or_else(|| trimmed.strip_prefix('*'))
            {
                let slug = slugify(bullet);
                if !slug.is_empty() {
                    capabilities.push(slug);
                }
            }
        }
    }

    SoulProfile {
        description,
        capabilities,
        role_prompt: content.to_string(),
    }
}

/// 小写 → 去掉除空格与连字符外的非字母数字 → 空白折叠为连字符
fn slugify(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let cleaned: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-')
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}
