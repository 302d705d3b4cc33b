//! 执行器依赖的外部协作方：运行控制、状态存储、静态预检、语义评审、子 Agent

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::core::{FailureCategory, WorkflowError};
use crate::llm::LlmClient;
use crate::workflow::types::WorkflowState;

/// 运行控制：run 是否仍允许继续（取消、限流等由外部决定）
#[async_trait]
pub trait RunControl: Send + Sync {
    async fn is_runnable(&self, run_id: &str, user_id: &str) -> bool;
}

/// 工作流状态与工具调用计数的外部存储
#[async_trait]
pub trait WorkflowStateStore: Send + Sync {
    async fn save_workflow_state(&self, run_id: &str, state: &WorkflowState) -> Result<(), WorkflowError>;

    async fn load_workflow_state(&self, run_id: &str) -> Result<Option<WorkflowState>, WorkflowError>;

    async fn clear_workflow_state(&self, run_id: &str) -> Result<(), WorkflowError>;

    async fn tool_call_count(&self, run_id: &str) -> Result<u32, WorkflowError>;

    /// 增加 n 次并返回新值
    async fn increment_tool_call_count(&self, run_id: &str, n: u32) -> Result<u32, WorkflowError>;

    async fn set_tool_call_count(&self, run_id: &str, count: u32) -> Result<(), WorkflowError>;
}

/// 静态预检结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrecheckResult {
    pub passed: bool,
    pub error_code: String,
    pub message: String,
    pub category: Option<FailureCategory>,
    pub report: Value,
}

impl PrecheckResult {
    pub fn pass(report: Value) -> Self {
        Self {
            passed: true,
            error_code: String::new(),
            message: String::new(),
            category: None,
            report,
        }
    }

    pub fn fail(error_code: impl Into<String>, message: impl Into<String>, report: Value) -> Self {
        Self {
            passed: false,
            error_code: error_code.into(),
            message: message.into(),
            category: Some(FailureCategory::Static),
            report,
        }
    }
}

/// 代码执行前的静态校验
pub trait StaticPrecheck: Send + Sync {
    fn check(&self, code: &str, dataset_refs: &str, params: &Map<String, Value>) -> PrecheckResult;
}

/// 语义评审请求
#[derive(Clone)]
pub struct JudgeRequest {
    pub run_id: String,
    pub user_goal: String,
    pub todo_id: String,
    pub tool_name: String,
    pub todo_reasoning: String,
    pub run_args: Map<String, Value>,
    pub code: String,
    pub tool_output: Value,
    /// 未配置专用评审模型时使用 run 模型
    pub fallback_model: Arc<dyn LlmClient>,
    pub fallback_endpoint_name: String,
    pub fallback_model_name: String,
}

/// 语义评审结论
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeVerdict {
    pub pass: bool,
    pub category: String,
    pub severity: String,
    pub reason: String,
    pub report: Value,
}

impl JudgeVerdict {
    pub fn pass(category: impl Into<String>, reason: impl Into<String>, report: Value) -> Self {
        Self {
            pass: true,
            category: category.into(),
            severity: "LOW".to_string(),
            reason: reason.into(),
            report,
        }
    }

    pub fn reject(
        category: impl Into<String>,
        severity: impl Into<String>,
        reason: impl Into<String>,
        report: Value,
    ) -> Self {
        Self {
            pass: false,
            category: category.into(),
            severity: severity.into(),
            reason: reason.into(),
            report,
        }
    }

    /// 评审关闭时的放行结论
    pub fn disabled() -> Self {
        Self::pass(
            "OK",
            "semantic judge disabled",
            json!({ "enabled": false, "reason": "semantic_enabled_false" }),
        )
    }
}

/// 工具成功后的语义评审
#[async_trait]
pub trait SemanticJudge: Send + Sync {
    async fn judge(&self, request: JudgeRequest) -> JudgeVerdict;
}

/// 子 Agent 请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAgentRequest {
    pub run_id: String,
    pub user_id: String,
    pub task_id: String,
    pub goal: String,
    /// JSON 文本：用户目标、解析后的参数、已完成的 todo
    pub context: String,
    pub seed_args: Map<String, Value>,
    pub tool_whitelist: Vec<String>,
    pub max_steps: u32,
    pub endpoint_name: String,
    pub model_name: String,
}

/// 子 Agent 结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct SubAgentResult {
    pub success: bool,
    pub answer: String,
    pub error: String,
    /// 子 Agent 实际执行的步数（计入 run 的工具调用数）
    pub steps: u32,
}

/// 子 Agent 执行器
#[async_trait]
pub trait SubAgentRunner: Send + Sync {
    async fn run(&self, request: SubAgentRequest, model: Arc<dyn LlmClient>) -> SubAgentResult;
}
