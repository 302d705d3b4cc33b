//! 语义评审：对 executePython 的成功结果做一次 LLM 校验
//!
//! 评审模型优先使用 [judge] 段配置的 endpoint / model（经 `LlmFactory` 解析），否则使用 run 模型。
//! 模型输出必须是带 pass / category / severity / reason_cn / fix_hint 的 JSON 对象，
//! 不合法时最多重试 max_attempts 次；仍失败则按 fail_open 放行或驳回。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::JudgeSection;
use crate::llm::{generate_with_timeout, LlmClient, LlmFactory, Message};
use crate::observability::{preview, LlmCallRecord, ObservabilityRecorder};
use crate::workflow::collaborators::{JudgeRequest, JudgeVerdict, SemanticJudge};
use crate::workflow::prompts::{extract_json, SEMANTIC_JUDGE_SYSTEM_PROMPT};

pub const CATEGORIES: [&str; 5] = [
    "OK",
    "NUMERIC_ANOMALY",
    "TIME_RANGE_MISMATCH",
    "DOMAIN_INVARIANT_VIOLATION",
    "INSUFFICIENT_EVIDENCE",
];
pub const SEVERITIES: [&str; 3] = ["LOW", "MEDIUM", "HIGH"];

const INSUFFICIENT_EVIDENCE: &str = "INSUFFICIENT_EVIDENCE";

struct SelectedModel {
    client: Arc<dyn LlmClient>,
    endpoint_name: String,
    model_name: String,
}

pub struct LlmSemanticJudge {
    section: JudgeSection,
    factory: Option<Arc<dyn LlmFactory>>,
    observer: Arc<dyn ObservabilityRecorder>,
    request_timeout: Duration,
}

impl LlmSemanticJudge {
    pub fn new(
        section: JudgeSection,
        observer: Arc<dyn ObservabilityRecorder>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            section,
            factory: None,
            observer,
            request_timeout,
        }
    }

    /// 配置了专用评审模型时需要
    pub fn with_factory(mut self, factory: Arc<dyn LlmFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    fn select_model(&self, request: &JudgeRequest) -> SelectedModel {
        let model = self.section.model.as_deref().map(str::trim).unwrap_or("");
        let factory = self.factory.as_ref().filter(|_| !model.is_empty());
        if let Some(factory) = factory {
            let endpoint = self.section.endpoint.as_deref().unwrap_or("").trim();
            match factory.resolve(endpoint, model, Some(self.section.temperature)) {
                Ok(resolved) => {
                    return SelectedModel {
                        client: resolved.client,
                        endpoint_name: resolved.endpoint_name,
                        model_name: resolved.model_name,
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint, model, error = %e, "init semantic judge model failed, using run model");
                }
            }
        }
        SelectedModel {
            client: Arc::clone(&request.fallback_model),
            endpoint_name: request.fallback_endpoint_name.clone(),
            model_name: request.fallback_model_name.clone(),
        }
    }

    fn build_payload(request: &JudgeRequest, attempt: u32) -> Value {
        json!({
            "user_goal": request.user_goal,
            "todo": {
                "id": request.todo_id,
                "tool": request.tool_name,
                "reasoning": request.todo_reasoning,
            },
            "run_args": request.run_args,
            "code": request.code,
            "tool_output": request.tool_output,
            "judge_attempt": attempt,
        })
    }
}

/// 校验评审输出的结构，返回失败原因
fn validate(parsed: &Value) -> Result<&Map<String, Value>, &'static str> {
    let root = parsed.as_object().ok_or("judge_output_not_object")?;
    if !root.get("pass").is_some_and(Value::is_boolean) {
        return Err("judge_output_missing_pass");
    }
    let category = root.get("category").and_then(Value::as_str).unwrap_or("").trim();
    if !CATEGORIES.contains(&category) {
        return Err("judge_output_invalid_category");
    }
    let severity = root.get("severity").and_then(Value::as_str).unwrap_or("").trim();
    if !SEVERITIES.contains(&severity) {
        return Err("judge_output_invalid_severity");
    }
    if !root.get("reason_cn").is_some_and(Value::is_string) {
        return Err("judge_output_missing_reason_cn");
    }
    if !root.get("fix_hint").is_some_and(Value::is_string) {
        return Err("judge_output_missing_fix_hint");
    }
    Ok(root)
}

fn text_field(root: &Map<String, Value>, key: &str) -> String {
    root.get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

#[async_trait]
impl SemanticJudge for LlmSemanticJudge {
    async fn judge(&self, request: JudgeRequest) -> JudgeVerdict {
        let selected = self.select_model(&request);
        let max_attempts = self.section.max_attempts.max(1);
        let mut failures: Vec<Value> = Vec::new();

        for attempt in 1..=max_attempts {
            let messages = vec![
                Message::system(SEMANTIC_JUDGE_SYSTEM_PROMPT),
                Message::user(Self::build_payload(&request, attempt).to_string()),
            ];
            let started = Instant::now();
            let generation =
                match generate_with_timeout(selected.client.as_ref(), &messages, self.request_timeout).await {
                    Ok(g) => g,
                    Err(e) => {
                        failures.push(json!({ "attempt": attempt, "reason": e.to_string() }));
                        continue;
                    }
                };
            self.observer.record_llm_call(&LlmCallRecord {
                run_id: request.run_id.clone(),
                stage: "workflow_semantic_judge".to_string(),
                endpoint_name: selected.endpoint_name.clone(),
                model_name: selected.model_name.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                token_usage: generation.token_usage,
                response_preview: preview(&generation.text, 200),
            });

            let parsed = extract_json(&generation.text)
                .and_then(|json| serde_json::from_str::<Value>(json).ok())
                .unwrap_or(Value::Null);
            let root = match validate(&parsed) {
                Ok(root) => root,
                Err(reason) => {
                    failures.push(json!({
                        "attempt": attempt,
                        "reason": reason,
                        "raw_preview": preview(&generation.text, 800),
                    }));
                    continue;
                }
            };

            let pass = root.get("pass").and_then(Value::as_bool).unwrap_or(false);
            let category = text_field(root, "category");
            let severity = text_field(root, "severity");
            let reason = text_field(root, "reason_cn");
            let mut report = json!({
                "attempt": attempt,
                "max_attempts": max_attempts,
                "judge_model": selected.model_name,
                "judge_endpoint": selected.endpoint_name,
                "reason_cn": reason,
                "fix_hint": text_field(root, "fix_hint"),
                "raw": parsed,
                "failures": failures,
            });

            if pass {
                return JudgeVerdict::pass(category, reason, report);
            }
            if category == INSUFFICIENT_EVIDENCE && !self.section.block_on_insufficient_evidence {
                report["insufficient_evidence_blocked"] = json!(false);
                let reason = if reason.is_empty() {
                    "INSUFFICIENT_EVIDENCE but configured to pass".to_string()
                } else {
                    reason
                };
                return JudgeVerdict::pass(category, reason, report);
            }
            return JudgeVerdict::reject(category, severity, reason, report);
        }

        tracing::warn!(
            run_id = %request.run_id,
            todo_id = %request.todo_id,
            attempts = max_attempts,
            fail_open = self.section.fail_open,
            "semantic judge output unusable"
        );
        let report = json!({
            "max_attempts": max_attempts,
            "judge_model": selected.model_name,
            "judge_endpoint": selected.endpoint_name,
            "failures": failures,
        });
        if self.section.fail_open {
            JudgeVerdict::pass(INSUFFICIENT_EVIDENCE, "judge 解析失败，按 failOpen 放行", report)
        } else {
            JudgeVerdict::reject(INSUFFICIENT_EVIDENCE, "HIGH", "judge 解析失败", report)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::observability::RecordingObserver;

    fn request(model: Arc<MockLlmClient>) -> JudgeRequest {
        JudgeRequest {
            run_id: "run-1".to_string(),
            user_goal: "计算收益率".to_string(),
            todo_id: "t1".to_string(),
            tool_name: "executePython".to_string(),
            todo_reasoning: "计算近一月收益率".to_string(),
            run_args: Map::new(),
            code: "print(1)".to_string(),
            tool_output: json!({"ok": true, "data": {"stdout": "1"}}),
            fallback_model: model,
            fallback_endpoint_name: "default".to_string(),
            fallback_model_name: "mock".to_string(),
        }
    }

    fn judge(section: JudgeSection) -> (LlmSemanticJudge, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let judge = LlmSemanticJudge::new(section, observer.clone(), Duration::from_secs(5));
        (judge, observer)
    }

    const REJECT: &str = r#"{"pass": false, "category": "NUMERIC_ANOMALY", "severity": "HIGH", "reason_cn": "收益率超过 1000%", "fix_hint": "检查复权"}"#;
    const PASS: &str = r#"{"pass": true, "category": "OK", "severity": "LOW", "reason_cn": "合理", "fix_hint": ""}"#;

    #[tokio::test]
    async fn test_reject_verdict() {
        let model = Arc::new(MockLlmClient::new("").with_response(REJECT));
        let (judge, observer) = judge(JudgeSection::default());
        let verdict = judge.judge(request(model)).await;
        assert!(!verdict.pass);
        assert_eq!(verdict.category, "NUMERIC_ANOMALY");
        assert_eq!(verdict.severity, "HIGH");
        assert_eq!(verdict.report["fix_hint"], "检查复权");
        assert_eq!(observer.llm_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_output_retried_then_pass() {
        let model = Arc::new(MockLlmClient::new("").with_response("not json").with_response(PASS));
        let (judge, _) = judge(JudgeSection::default());
        let verdict = judge.judge(request(model.clone())).await;
        assert!(verdict.pass);
        assert_eq!(model.call_count(), 2);
        assert_eq!(verdict.report["failures"][0]["reason"], "judge_output_not_object");
    }

    #[tokio::test]
    async fn test_fail_open_and_fail_closed() {
        let model = Arc::new(MockLlmClient::new("garbage"));
        let (open, _) = judge(JudgeSection::default());
        assert!(open.judge(request(model.clone())).await.pass);

        let (closed, _) = judge(JudgeSection {
            fail_open: false,
            ..Default::default()
        });
        let verdict = closed.judge(request(model)).await;
        assert!(!verdict.pass);
        assert_eq!(verdict.category, "INSUFFICIENT_EVIDENCE");
    }

    #[tokio::test]
    async fn test_insufficient_evidence_passes_unless_blocking() {
        let text = r#"{"pass": false, "category": "INSUFFICIENT_EVIDENCE", "severity": "MEDIUM", "reason_cn": "输出太少", "fix_hint": "打印更多"}"#;
        let model = Arc::new(MockLlmClient::new(text));
        let (lenient, _) = judge(JudgeSection::default());
        assert!(lenient.judge(request(model.clone())).await.pass);

        let (strict, _) = judge(JudgeSection {
            block_on_insufficient_evidence: true,
            ..Default::default()
        });
        assert!(!strict.judge(request(model)).await.pass);
    }

    #[test]
    fn test_validate_rejects_unknown_severity() {
        let parsed = json!({"pass": true, "category": "OK", "severity": "CRITICAL", "reason_cn": "", "fix_hint": ""});
        assert_eq!(validate(&parsed).unwrap_err(), "judge_output_invalid_severity");
    }
}
