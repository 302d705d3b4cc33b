//! Todo 计划构建器
//!
//! 提供流畅的 API 来构建 TodoPlan；sequence 按添加顺序自动编号

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::core::WorkflowError;
use crate::workflow::types::{ExecutionMode, TodoItem, TodoPlan, TodoType};

/// 计划构建器
pub struct TodoPlanBuilder {
    plan_id: String,
    items: Vec<TodoItem>,
}

impl TodoPlanBuilder {
    pub fn new() -> Self {
        Self {
            plan_id: format!("plan_{}", uuid::Uuid::new_v4()),
            items: Vec::new(),
        }
    }

    /// 指定计划 ID（默认随机生成）
    pub fn plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = plan_id.into();
        self
    }

    fn next_sequence(&self) -> u32 {
        self.items.len() as u32 + 1
    }

    /// 添加工具调用
    pub fn tool_call(
        mut self,
        id: impl Into<String>,
        tool_name: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        let item = TodoItem::tool_call(id, self.next_sequence(), tool_name, params);
        self.items.push(item);
        self
    }

    /// 添加纯思考步骤
    pub fn thought(mut self, id: impl Into<String>, reasoning: impl Into<String>) -> Self {
        let mut item = TodoItem::tool_call(id, self.next_sequence(), "", Map::new());
        item.todo_type = TodoType::Thought;
        item.reasoning = reasoning.into();
        self.items.push(item);
        self
    }

    /// 添加子 Agent 任务；goal 写入 reasoning
    pub fn sub_agent(
        mut self,
        id: impl Into<String>,
        goal: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        let mut item = TodoItem::tool_call(id, self.next_sequence(), "", params);
        item.todo_type = TodoType::SubAgent;
        item.reasoning = goal.into();
        self.items.push(item);
        self
    }

    /// 为最近添加的 todo 设置说明
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        if let Some(item) = self.items.last_mut() {
            item.reasoning = reasoning.into();
        }
        self
    }

    /// 为最近添加的 todo 设置执行模式
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        if let Some(item) = self.items.last_mut() {
            item.execution_mode = Some(mode);
        }
        self
    }

    /// 构建计划
    pub fn build(self) -> Result<TodoPlan, WorkflowError> {
        if self.items.is_empty() {
            return Err(WorkflowError::InvalidPlan("plan has no todo items".to_string()));
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.id.trim().is_empty() {
                return Err(WorkflowError::InvalidPlan(format!(
                    "todo #{} has a blank id",
                    item.sequence
                )));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(WorkflowError::InvalidPlan(format!("duplicate todo id: {}", item.id)));
            }
            if item.todo_type == TodoType::ToolCall && item.tool_name.trim().is_empty() {
                return Err(WorkflowError::InvalidPlan(format!(
                    "todo {} is a tool call without tool name",
                    item.id
                )));
            }
        }
        Ok(TodoPlan {
            plan_id: self.plan_id,
            items: self.items,
        })
    }
}

impl Default for TodoPlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 由 JSON 字面量构造参数表；非对象时返回空表
pub fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_plan_in_order() {
        let plan = TodoPlanBuilder::new()
            .plan_id("p1")
            .tool_call("t1", "searchStock", params(json!({"keyword": "茅台"})))
            .reasoning("先找代码")
            .thought("t2", "比较两只股票")
            .sub_agent("t3", "深入分析", Map::new())
            .mode(ExecutionMode::Manual)
            .build()
            .expect("Failed to build plan");

        assert_eq!(plan.plan_id, "p1");
        assert_eq!(plan.items.len(), 3);
        assert_eq!(plan.items[0].sequence, 1);
        assert_eq!(plan.items[0].reasoning, "先找代码");
        assert_eq!(plan.items[1].todo_type, TodoType::Thought);
        assert_eq!(plan.items[2].todo_type, TodoType::SubAgent);
        assert_eq!(plan.items[2].execution_mode, Some(ExecutionMode::Manual));
    }

    #[test]
    fn test_empty_plan_fails() {
        assert!(matches!(
            TodoPlanBuilder::new().build(),
            Err(WorkflowError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_duplicate_id_fails() {
        let result = TodoPlanBuilder::new()
            .tool_call("t1", "searchStock", Map::new())
            .tool_call("t1", "searchFund", Map::new())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_tool_call_without_tool_name_fails() {
        let result = TodoPlanBuilder::new().tool_call("t1", " ", Map::new()).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_generated_plan_id() {
        let plan = TodoPlanBuilder::new().thought("t1", "x").build().unwrap();
        assert!(plan.plan_id.starts_with("plan_"));
    }
}
