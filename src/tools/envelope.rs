//! 统一工具输出协议
//!
//! 成功：`{ok: true, tool, data, error: null}`；失败：`{ok: false, tool, data: {}, error: {code, message, details}}`。
//! 只有满足该结构（布尔 ok + 对象 data 或对象 error）的结果才允许写入缓存。

use serde_json::{json, Map, Value};

pub const UNSUPPORTED_TOOL: &str = "UNSUPPORTED_TOOL";
pub const TOOL_INVOCATION_ERROR: &str = "TOOL_INVOCATION_ERROR";
pub const EMPTY_LOADER_RESULT: &str = "EMPTY_LOADER_RESULT";
pub const INTERRUPTED: &str = "INTERRUPTED";

/// 成功信封
pub fn success(tool: &str, data: Value) -> String {
    json!({
        "ok": true,
        "tool": tool,
        "data": data,
        "error": Value::Null,
    })
    .to_string()
}

/// 失败信封
pub fn failure(tool: &str, code: &str, message: &str, details: Value) -> String {
    json!({
        "ok": false,
        "tool": tool,
        "data": {},
        "error": {
            "code": code,
            "message": message,
            "details": details,
        },
    })
    .to_string()
}

/// 是否满足结构化协议
pub fn is_structured(result: &str) -> bool {
    let Some(root) = parse_object(result) else {
        return false;
    };
    if !matches!(root.get("ok"), Some(Value::Bool(_))) {
        return false;
    }
    matches!(root.get("data"), Some(Value::Object(_)))
        || matches!(root.get("error"), Some(Value::Object(_)))
}

/// 解析信封中的 ok 字段，无法解析时视为失败
pub fn is_ok(result: &str) -> bool {
    parse_object(result)
        .and_then(|root| root.get("ok").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// 解析为 JSON 对象；空白或非对象返回 None
pub fn parse_object(text: &str) -> Option<Map<String, Value>> {
    if text.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
