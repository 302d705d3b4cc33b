//! 可观测性：tracing 初始化、结构化工具调用记录、指标注册表
//!
//! `ObservabilityRecorder` 的所有方法都是「尽力而为」的单向调用：不返回错误、不阻塞调用方。

pub mod metrics;

use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cache::CacheMeta;
use crate::core::FailureCategory;
use crate::llm::TokenUsage;

pub use metrics::{Counter, MetricsRegistry, MetricsSnapshot, Timer, TimerSnapshot};

/// 安装全局 tracing subscriber（RUST_LOG 未设置时默认 info）
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 一次工具调用的观测记录
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub run_id: String,
    pub phase: String,
    pub tool_name: String,
    pub params: Value,
    pub output: String,
    pub duration_ms: u64,
    pub success: bool,
    pub cache: CacheMeta,
    pub error: Option<String>,
}

/// 一次模型调用的观测记录（恢复 / 总结 / 评审）
#[derive(Debug, Clone, Serialize)]
pub struct LlmCallRecord {
    pub run_id: String,
    pub stage: String,
    pub endpoint_name: String,
    pub model_name: String,
    pub duration_ms: u64,
    pub token_usage: TokenUsage,
    pub response_preview: String,
}

/// 观测上报（外部协作方）
pub trait ObservabilityRecorder: Send + Sync {
    fn record_tool_call(&self, record: &ToolCallRecord);

    fn record_semantic_judge_call(&self, run_id: &str, rejected: bool);

    fn record_recovery_attempt(&self, run_id: &str, category: FailureCategory);

    fn record_llm_call(&self, record: &LlmCallRecord);
}

/// 默认实现：每次调用输出一行结构化审计日志
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl ObservabilityRecorder for TracingRecorder {
    fn record_tool_call(&self, record: &ToolCallRecord) {
        let audit = serde_json::json!({
            "event": "tool_audit",
            "run_id": record.run_id,
            "phase": record.phase,
            "tool": record.tool_name,
            "ok": record.success,
            "duration_ms": record.duration_ms,
            "cache": record.cache.to_payload(),
            "args_preview": preview(&record.params.to_string(), 200),
        });
        tracing::info!(audit = %audit, "tool");
    }

    fn record_semantic_judge_call(&self, run_id: &str, rejected: bool) {
        tracing::info!(run_id, rejected, "semantic judge call");
    }

    fn record_recovery_attempt(&self, run_id: &str, category: FailureCategory) {
        tracing::info!(run_id, category = %category, "recovery attempt");
    }

    fn record_llm_call(&self, record: &LlmCallRecord) {
        tracing::info!(
            run_id = %record.run_id,
            stage = %record.stage,
            model = %record.model_name,
            duration_ms = record.duration_ms,
            total_tokens = record.token_usage.total_tokens,
            "llm call"
        );
    }
}

/// 记录到内存，供测试与调试断言
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub tool_calls: Mutex<Vec<ToolCallRecord>>,
    pub judge_calls: Mutex<Vec<(String, bool)>>,
    pub recovery_attempts: Mutex<Vec<(String, FailureCategory)>>,
    pub llm_calls: Mutex<Vec<LlmCallRecord>>,
}

impl RecordingObserver {
    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        self.tool_calls.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn recovery_attempts(&self) -> Vec<(String, FailureCategory)> {
        self.recovery_attempts.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn judge_calls(&self) -> Vec<(String, bool)> {
        self.judge_calls.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl ObservabilityRecorder for RecordingObserver {
    fn record_tool_call(&self, record: &ToolCallRecord) {
        if let Ok(mut v) = self.tool_calls.lock() {
            v.push(record.clone());
        }
    }

    fn record_semantic_judge_call(&self, run_id: &str, rejected: bool) {
        if let Ok(mut v) = self.judge_calls.lock() {
            v.push((run_id.to_string(), rejected));
        }
    }

    fn record_recovery_attempt(&self, run_id: &str, category: FailureCategory) {
        if let Ok(mut v) = self.recovery_attempts.lock() {
            v.push((run_id.to_string(), category));
        }
    }

    fn record_llm_call(&self, record: &LlmCallRecord) {
        if let Ok(mut v) = self.llm_calls.lock() {
            v.push(record.clone());
        }
    }
}

/// 截断到最多 max 个字符
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        text.chars().take(max).collect()
    } else {
        text.to_string()
    }
}
