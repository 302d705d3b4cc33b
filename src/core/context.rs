//! 调用上下文：run / 用户 / 阶段 / todo
//!
//! 显式传入 ToolRouter，替代线程局部状态；缺失时路由照常执行，只是跳过观测上报并使用 global 缓存作用域。

use serde::Serialize;

/// 执行阶段（用于观测记录）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ToolExecution,
    SubAgent,
    Summarizing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ToolExecution => "tool_execution",
            Phase::SubAgent => "sub_agent",
            Phase::Summarizing => "summarizing",
        }
    }
}

/// 单次工具调用所在的 run 上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub run_id: String,
    pub user_id: String,
    pub phase: Phase,
    pub todo_id: Option<String>,
}

impl InvocationContext {
    pub fn new(run_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            user_id: user_id.into(),
            phase: Phase::ToolExecution,
            todo_id: None,
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_todo(mut self, todo_id: impl Into<String>) -> Self {
        self.todo_id = Some(todo_id.into());
        self
    }

    /// 缓存作用域：有用户时按用户隔离，否则 global
    pub fn cache_scope(&self) -> String {
        scope_for_user(Some(&self.user_id))
    }
}

/// 由用户 ID 得到缓存作用域 token：`user:<id>` 或 `global`
pub fn scope_for_user(user_id: Option<&str>) -> String {
    match user_id.map(str::trim) {
        Some(id) if !id.is_empty() => format!("user:{id}"),
        _ => "global".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_for_user() {
        assert_eq!(scope_for_user(Some(" u1 ")), "user:u1");
        assert_eq!(scope_for_user(Some("  ")), "global");
        assert_eq!(scope_for_user(None), "global");
    }

    #[test]
    fn test_context_builder() {
        let ctx = InvocationContext::new("run1", "u1")
            .with_phase(Phase::SubAgent)
            .with_todo("t1");
        assert_eq!(ctx.cache_scope(), "user:u1");
        assert_eq!(ctx.phase.as_str(), "sub_agent");
        assert_eq!(ctx.todo_id.as_deref(), Some("t1"));
    }
}
