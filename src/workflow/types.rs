//! 工作流类型定义
//!
//! Todo 计划、单个 todo、执行记录、持久化状态、请求与结果

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::FailureCategory;
use crate::llm::LlmClient;
use crate::tools::ToolName;

/// Todo 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TodoType {
    /// 调用一个工具
    #[default]
    ToolCall,
    /// 纯思考步骤，不调用工具
    Thought,
    /// 委托子 Agent 完成
    SubAgent,
}

impl TodoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoType::ToolCall => "TOOL_CALL",
            TodoType::Thought => "THOUGHT",
            TodoType::SubAgent => "SUB_AGENT",
        }
    }
}

/// Todo 状态：PENDING → RUNNING → {SUCCEEDED | FAILED | SKIPPED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TodoStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TodoStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TodoStatus::Succeeded | TodoStatus::Failed | TodoStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TodoStatus::Pending => "PENDING",
            TodoStatus::Running => "RUNNING",
            TodoStatus::Succeeded => "SUCCEEDED",
            TodoStatus::Failed => "FAILED",
            TodoStatus::Skipped => "SKIPPED",
        }
    }
}

/// 执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    #[default]
    Auto,
    /// 与 AUTO 相同的执行路径（人工确认在外部完成）
    Manual,
    /// 无论 todo 类型，一律委托子 Agent
    ForceSubAgent,
}

impl ExecutionMode {
    /// 忽略大小写解析，无法识别时回退 AUTO
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "MANUAL" => ExecutionMode::Manual,
            "FORCE_SUB_AGENT" => ExecutionMode::ForceSubAgent,
            _ => ExecutionMode::Auto,
        }
    }
}

/// 计划中的单个 todo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub sequence: u32,
    #[serde(default)]
    pub todo_type: TodoType,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// 未指定时使用配置中的默认模式
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    pub status: TodoStatus,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub result_summary: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

impl TodoItem {
    pub fn tool_call(
        id: impl Into<String>,
        sequence: u32,
        tool_name: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            sequence,
            todo_type: TodoType::ToolCall,
            tool_name: tool_name.into(),
            params,
            execution_mode: None,
            status: TodoStatus::Pending,
            reasoning: String::new(),
            result_summary: String::new(),
            output: String::new(),
            completed_at: None,
        }
    }

    /// 更新状态；已处于终态时拒绝覆盖并返回 false
    pub fn set_status(&mut self, status: TodoStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    pub fn is_code_execution(&self) -> bool {
        ToolName::parse(self.tool_name.trim()) == Some(ToolName::ExecutePython)
    }
}

/// Todo 计划：items 的顺序即执行顺序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TodoPlan {
    pub plan_id: String,
    pub items: Vec<TodoItem>,
}

/// 单次尝试的执行记录（写入 run 上下文，供恢复与最终总结使用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TodoExecutionRecord {
    pub success: bool,
    pub output: String,
    pub summary: String,
    pub tool_calls_used: u32,
    #[serde(default)]
    pub failure_category: Option<FailureCategory>,
    #[serde(default)]
    pub precheck_report: Option<Value>,
    #[serde(default)]
    pub semantic_judge_report: Option<Value>,
    /// 调用上限等不可恢复的失败，不进入恢复流程
    #[serde(skip)]
    pub unrecoverable: bool,
}

impl TodoExecutionRecord {
    pub fn succeeded(output: impl Into<String>, summary: impl Into<String>, tool_calls_used: u32) -> Self {
        Self {
            success: true,
            output: output.into(),
            summary: summary.into(),
            tool_calls_used,
            ..Default::default()
        }
    }

    pub fn failed(
        output: impl Into<String>,
        summary: impl Into<String>,
        tool_calls_used: u32,
        category: FailureCategory,
    ) -> Self {
        Self {
            success: false,
            output: output.into(),
            summary: summary.into(),
            tool_calls_used,
            failure_category: Some(category),
            ..Default::default()
        }
    }

    /// 失败分类；未标注时视为 RUNTIME
    pub fn category(&self) -> FailureCategory {
        self.failure_category.unwrap_or(FailureCategory::Runtime)
    }
}

/// 外部持久化的工作流状态（用于暂停后恢复）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkflowState {
    pub current_index: usize,
    pub completed_items: Vec<TodoItem>,
    pub context: BTreeMap<String, TodoExecutionRecord>,
    pub tool_calls_used: u32,
    pub saved_at: i64,
}

/// 声明给模型的工具说明（子 Agent 的工具白名单）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

impl ToolSpec {
    /// 全部内置工具
    pub fn supported() -> Vec<ToolSpec> {
        ToolName::ALL
            .iter()
            .map(|t| ToolSpec {
                name: t.as_str().to_string(),
                description: t.description().to_string(),
            })
            .collect()
    }
}

/// 执行请求
#[derive(Clone)]
pub struct WorkflowRequest {
    pub run_id: String,
    pub user_id: String,
    pub user_goal: String,
    pub plan: TodoPlan,
    /// 本次 run 使用的模型（恢复 / 总结的默认模型）
    pub model: Arc<dyn LlmClient>,
    pub tool_specs: Vec<ToolSpec>,
    pub endpoint_name: String,
    pub endpoint_base_url: String,
    pub model_name: String,
}

impl fmt::Debug for WorkflowRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRequest")
            .field("run_id", &self.run_id)
            .field("user_id", &self.user_id)
            .field("user_goal", &self.user_goal)
            .field("plan", &self.plan)
            .field("model_name", &self.model_name)
            .finish_non_exhaustive()
    }
}

/// 整体结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowOutcome {
    /// 全部 todo 终态且无失败
    Complete,
    /// 运行控制要求暂停
    Paused,
    /// fail-fast 触发
    Aborted,
    /// 全部 todo 终态但存在失败
    PartialFailure,
}

/// 执行结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowExecutionResult {
    pub success: bool,
    pub paused: bool,
    pub outcome: WorkflowOutcome,
    pub failure_reason: String,
    pub final_answer: String,
    /// 本次调用处理过的 todo（含失败）
    pub completed_items: Vec<TodoItem>,
    /// 运行结束时的完整计划（含每个 todo 的最终状态）
    pub plan: TodoPlan,
    pub context: BTreeMap<String, TodoExecutionRecord>,
    pub tool_calls_used: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status_not_overwritten() {
        let mut item = TodoItem::tool_call("t1", 1, "searchStock", Map::new());
        assert!(item.set_status(TodoStatus::Running));
        assert!(item.set_status(TodoStatus::Succeeded));
        assert!(!item.set_status(TodoStatus::Failed));
        assert!(!item.set_status(TodoStatus::Pending));
        assert_eq!(item.status, TodoStatus::Succeeded);
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!(ExecutionMode::parse("manual"), ExecutionMode::Manual);
        assert_eq!(ExecutionMode::parse(" force_sub_agent "), ExecutionMode::ForceSubAgent);
        assert_eq!(ExecutionMode::parse("whatever"), ExecutionMode::Auto);
        assert_eq!(ExecutionMode::parse(""), ExecutionMode::Auto);
    }

    #[test]
    fn test_todo_item_deserialize_defaults() {
        let item: TodoItem = serde_json::from_str(
            r#"{"id": "t1", "sequence": 1, "tool_name": "executePython", "todo_type": "TOOL_CALL"}"#,
        )
        .unwrap();
        assert_eq!(item.status, TodoStatus::Pending);
        assert!(item.execution_mode.is_none());
        assert!(item.is_code_execution());
    }

    #[test]
    fn test_record_category_defaults_to_runtime() {
        let record = TodoExecutionRecord {
            success: false,
            ..Default::default()
        };
        assert_eq!(record.category(), FailureCategory::Runtime);
    }
}
