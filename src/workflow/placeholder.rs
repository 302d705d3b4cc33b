//! 未解析占位符检查
//!
//! 计划里的参数可能引用前序 todo 的输出（如 `${t1.output.ts_code}`）。
//! 残留的 `${...}` 在调用前拦下，不会到达后端或写入缓存。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

pub const PARAM_PLACEHOLDER_UNRESOLVED: &str = "PARAM_PLACEHOLDER_UNRESOLVED";

static UNRESOLVED_PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn unresolved_placeholder_re() -> &'static Regex {
    UNRESOLVED_PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\$\{[^}]+\}").unwrap())
}

/// 一处未解析的占位符
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedPlaceholder {
    /// 参数路径，如 `filters.codes[0]`
    pub param_key: String,
    pub raw_placeholder: String,
}

/// 递归收集参数中的 `${...}`，按 (路径, 占位符) 去重，保持出现顺序
pub fn collect_unresolved(params: &Map<String, Value>) -> Vec<UnresolvedPlaceholder> {
    let mut refs = Vec::new();
    let mut seen = HashSet::new();
    for (key, value) in params {
        walk(value, key, &mut refs, &mut seen);
    }
    refs
}

fn walk(
    value: &Value,
    path: &str,
    refs: &mut Vec<UnresolvedPlaceholder>,
    seen: &mut HashSet<(String, String)>,
) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let next = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                walk(child, &next, refs, seen);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                walk(child, &format!("{path}[{idx}]"), refs, seen);
            }
        }
        Value::String(text) if text.contains("${") => {
            let param_key = if path.is_empty() { "<root>" } else { path };
            for m in unresolved_placeholder_re().find_iter(text) {
                let raw = m.as_str().to_string();
                if seen.insert((param_key.to_string(), raw.clone())) {
                    refs.push(UnresolvedPlaceholder {
                        param_key: param_key.to_string(),
                        raw_placeholder: raw,
                    });
                }
            }
        }
        _ => {}
    }
}
