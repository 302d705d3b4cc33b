//! 错误类型
//!
//! Todo 级别的失败（STATIC / RUNTIME / SEMANTIC）不会以 Err 形式逃出 `execute()`，
//! 由恢复策略在 todo 边界处理；这里的错误类型仅用于基础设施与请求构造层面。

use thiserror::Error;

/// 工作流执行器对外暴露的错误：只在请求本身非法或外部状态存储不可用时返回
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid workflow request: {0}")]
    InvalidRequest(String),

    #[error("Workflow state store error: {0}")]
    StateStore(String),

    #[error("Invalid todo plan: {0}")]
    InvalidPlan(String),
}

/// 工具后端执行错误（最终都会被转换为结构化失败信封，不会抛给调用方）
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("Tool backend failed: {0}")]
    Backend(String),

    #[error("Tool timeout: {0}")]
    Timeout(String),

    #[error("Tool interrupted: {0}")]
    Interrupted(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArgs(String),
}

impl ToolError {
    /// 对应信封中的 error.code
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Backend(_) => "TOOL_INVOCATION_ERROR",
            ToolError::Timeout(_) => "TOOL_TIMEOUT",
            ToolError::Interrupted(_) => "INTERRUPTED",
            ToolError::InvalidArgs(_) => "INVALID_TOOL_ARGS",
        }
    }
}

/// 缓存层错误：一律在本地降级为「不走缓存」
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(String),

    #[error("Cache payload serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
