//! 语义化版本范围解析
//!
//! 支持 npm 风格的版本表达式：`^1.2.0`、`~1.2`、`1.x`、`*`、`>=1.0.0 <2.0.0`、
//! `1.2.3 - 2.0.0` 以及用 `||` 连接的多个范围。

use semver::{Version, VersionReq};

use crate::error::{DiscoveryError, Result};

/// 解析后的版本要求（多个备选范围之间为"或"关系）
#[derive(Debug, Clone)]
pub struct Requirement {
    alternatives: Vec<VersionReq>,
}

impl Requirement {
    /// 解析版本表达式，格式非法时返回 `None`
    pub fn parse(expression: &str) -> Option<Self> {
        let alternatives = expression
            .split("||")
            .map(|alt| normalize_range(alt.trim()).and_then(|s| VersionReq::parse(&s).ok()))
            .collect::<Option<Vec<_>>>()?;

        if alternatives.is_empty() {
            return None;
        }
        Some(Self { alternatives })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

/// 宽松解析版本号，允许 `v` 或 `=` 前缀
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('=')
        .unwrap_or(trimmed)
        .trim_start_matches(['v', 'V']);
    Version::parse(trimmed).ok()
}

/// 版本字符串是否包含通配符
fn has_wildcard(expression: &str) -> bool {
    expression.contains(['*', 'x', 'X'])
}

/// 把 npm 风格的范围改写成 semver crate 接受的逗号分隔形式
fn normalize_range(range: &str) -> Option<String> {
    if range.is_empty() {
        return Some("*".to_string());
    }

    // 连字符范围：`1.2.3 - 2.0.0`
    if let Some((low, high)) = range.split_once(" - ") {
        let low = low.trim().trim_start_matches(['v', 'V']);
        let high = high.trim().trim_start_matches(['v', 'V']);
        if low.is_empty() || high.is_empty() {
            return None;
        }
        return Some(format!(">={}, <={}", low, high));
    }

    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in range.split(|c: char| c.is_whitespace() || c == ',') {
        if token.is_empty() {
            continue;
        }
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
            pending_op = Some(token);
            continue;
        }
        let token = strip_version_prefix(token);
        match pending_op.take() {
            Some(op) => comparators.push(format!("{}{}", op, token)),
            None => comparators.push(token),
        }
    }
    if pending_op.is_some() || comparators.is_empty() {
        return None;
    }
    Some(comparators.join(", "))
}

/// 去掉比较符后面紧跟的 `v` 前缀，例如 `^v1.2.0`
fn strip_version_prefix(token: &str) -> String {
    let op_len = token
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
        .unwrap_or(token.len());
    let (op, rest) = token.split_at(op_len);
    format!("{}{}", op, rest.trim_start_matches(['v', 'V']))
}

/// 是否为需要对照可用版本解析的范围表达式
pub fn is_range(requested: &str) -> bool {
    Requirement::parse(requested).is_some() && (has_wildcard(requested) || parse_version(requested).is_none())
}

/// 把请求的版本表达式解析为一个具体版本
///
/// - 表达式非法：原样返回
/// - 精确版本（不含通配符）：原样返回
/// - 否则从可用版本中选出满足范围的最高版本；都不满足时原样返回
pub fn resolve<S: AsRef<str>>(requested: &str, available: &[S]) -> String {
    match resolve_strict(requested, available) {
        Ok(version) => version,
        Err(_) => requested.to_string(),
    }
}

/// 与 [`resolve`] 相同，但范围无法满足时返回 `VersionResolution` 错误
pub fn resolve_strict<S: AsRef<str>>(requested: &str, available: &[S]) -> Result<String> {
    let Some(requirement) = Requirement::parse(requested) else {
        return Ok(requested.to_string());
    };
    if !is_range(requested) {
        return Ok(requested.to_string());
    }

    let mut candidates: Vec<(Version, &str)> = available
        .iter()
        .map(|s| s.as_ref())
        .filter_map(|raw| parse_version(raw).map(|v| (v, raw)))
        .collect();

    // 优先级相同（只有 build metadata 不同）时按原始字符串排序
    candidates.sort_by(|(a, raw_a), (b, raw_b)| a.cmp_precedence(b).then_with(|| raw_a.cmp(raw_b)));

    candidates
        .iter()
        .rev()
        .find(|(version, _)| requirement.matches(version))
        .map(|(_, raw)| raw.to_string())
        .ok_or_else(|| DiscoveryError::VersionResolution {
            requested: requested.to_string(),
        })
}
