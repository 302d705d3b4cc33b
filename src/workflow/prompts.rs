//! 执行器使用的系统提示词与用户消息拼装

use serde_json::{json, Map, Value};

use crate::workflow::types::{TodoExecutionRecord, TodoItem};
use std::collections::BTreeMap;

/// 失败 todo 的参数修复
pub const RECOVERY_SYSTEM_PROMPT: &str = r#"你是工作流执行中的参数修复助手。
输入是一个执行失败的 todo：包含用户目标、失败的工具调用、错误信息、失败分类（STATIC / RUNTIME / SEMANTIC）以及已完成 todo 的上下文。
请根据错误信息修正该 todo 的参数，只输出一个 JSON 对象，不要输出其他内容：
- 可以修复时：{"params": {...修正后的完整参数...}}
- 无法修复时：{"abandon": true}
要求：
1. STATIC 失败通常是代码或参数不完整，优先补齐缺失字段（如 code、dataset_id）。
2. 代码中访问数据集请使用 /sandbox/input/<dataset_id>/ 路径，不要使用 /datasets。
3. SEMANTIC 失败说明结果与任务意图不符，请参考 semantic_judge_report 中的 fix_hint 调整。
4. 保持参数名不变，不要新增与工具无关的字段。"#;

/// 全部 todo 执行完后的总结
pub const FINAL_ANSWER_SYSTEM_PROMPT: &str = r#"你是金融数据分析助手。
下面给出用户需求、每个 todo 的执行摘要以及详细的执行上下文。
请基于执行结果直接回答用户需求：
1. 只使用执行上下文中出现的数据，不要编造数字。
2. 若有 todo 失败，说明哪些信息未能获取以及可能原因。
3. 用简洁的中文分点作答。"#;

/// Python 执行结果的语义评审
pub const SEMANTIC_JUDGE_SYSTEM_PROMPT: &str = r#"你是 Python 数据分析结果的语义评审员。
输入包含用户目标、todo 说明、运行参数、执行的代码以及工具输出。
判断输出是否真正回答了 todo 的意图，只输出一个 JSON 对象：
{"pass": true|false, "category": "...", "severity": "...", "reason_cn": "...", "fix_hint": "..."}
category 取值：OK、NUMERIC_ANOMALY（数值明显异常）、TIME_RANGE_MISMATCH（时间范围与要求不符）、DOMAIN_INVARIANT_VIOLATION（违反领域常识，如价格为负）、INSUFFICIENT_EVIDENCE（输出不足以判断）。
severity 取值：LOW、MEDIUM、HIGH。
pass 为 true 时 category 应为 OK。"#;

/// 恢复请求的用户消息
pub fn recovery_user_payload(
    user_goal: &str,
    item: &TodoItem,
    failed: &TodoExecutionRecord,
    context: &BTreeMap<String, TodoExecutionRecord>,
) -> Value {
    json!({
        "user_goal": user_goal,
        "failed_todo": {
            "id": item.id,
            "tool": item.tool_name,
            "params": item.params,
            "reasoning": item.reasoning,
            "error": failed.summary,
            "error_category": failed.category().as_str(),
            "precheck_report": failed.precheck_report.clone().unwrap_or_else(|| Value::Object(Map::new())),
            "semantic_judge_report": failed.semantic_judge_report.clone().unwrap_or_else(|| Value::Object(Map::new())),
        },
        "context": context,
    })
}

/// 总结请求的用户消息
pub fn final_answer_user_message(
    user_goal: &str,
    processed: &[TodoItem],
    context: &BTreeMap<String, TodoExecutionRecord>,
) -> String {
    let summary: Vec<Value> = processed
        .iter()
        .map(|item| {
            json!({
                "id": item.id,
                "sequence": item.sequence,
                "type": item.todo_type.as_str(),
                "status": item.status.as_str(),
                "summary": item.result_summary,
            })
        })
        .collect();
    format!(
        "当前轮次用户需求: {}\n执行摘要: {}\n执行上下文: {}",
        user_goal,
        Value::Array(summary),
        serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string())
    )
}

/// 从模型回复中截取第一个 `{` 到最后一个 `}` 之间的文本
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailureCategory;

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("好的：\n{\"params\": {}}\n完毕"), Some("{\"params\": {}}"));
        assert_eq!(extract_json("no json"), None);
        assert_eq!(extract_json("} {"), None);
    }

    #[test]
    fn test_recovery_payload_shape() {
        let item = TodoItem::tool_call("t1", 1, "executePython", Map::new());
        let mut failed = TodoExecutionRecord::failed("", "STATIC_PRECHECK_FAILED: code 不能为空", 0, FailureCategory::Static);
        failed.precheck_report = Some(json!({"issues": ["code 不能为空"]}));
        let payload = recovery_user_payload("分析走势", &item, &failed, &BTreeMap::new());
        assert_eq!(payload["failed_todo"]["error_category"], "STATIC");
        assert_eq!(payload["failed_todo"]["precheck_report"]["issues"][0], "code 不能为空");
        assert_eq!(payload["failed_todo"]["semantic_judge_report"], json!({}));
    }
}
