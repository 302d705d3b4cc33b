//! 失败分类与恢复策略
//!
//! 每个 todo 失败后由 `RecoveryPolicy::decide` 决定是否允许再次尝试：
//! 分类计数（static / runtime / semantic）与合计计数都必须有余量，且总尝试次数（含首次）不超过 max_retries_per_todo。
//! 预算耗尽时返回 `Exhausted`，并标明是哪一项先耗尽，供执行器发出可观测的终止事件。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::WorkflowConfig;

/// Todo 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    /// 执行前校验失败（静态预检）
    Static,
    /// 执行期失败（超时、后端错误、非零退出、不支持的工具、被中断）
    Runtime,
    /// 工具名义上成功但被语义评审判定无效
    Semantic,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Static => "STATIC",
            FailureCategory::Runtime => "RUNTIME",
            FailureCategory::Semantic => "SEMANTIC",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个 todo 在本次 run 内的重试计数；todo 进入终态即丢弃
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryBudget {
    /// 已执行的尝试次数（含首次）
    pub attempts: u32,
    pub static_retries: u32,
    pub runtime_retries: u32,
    pub semantic_retries: u32,
    pub total_retries: u32,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次失败的尝试
    pub fn record_failure(&mut self) {
        self.attempts += 1;
    }

    /// 消耗一次恢复重试
    pub fn consume(&mut self, category: FailureCategory) {
        self.total_retries += 1;
        match category {
            FailureCategory::Static => self.static_retries += 1,
            FailureCategory::Runtime => self.runtime_retries += 1,
            FailureCategory::Semantic => self.semantic_retries += 1,
        }
    }

    pub fn used(&self, category: FailureCategory) -> u32 {
        match category {
            FailureCategory::Static => self.static_retries,
            FailureCategory::Runtime => self.runtime_retries,
            FailureCategory::Semantic => self.semantic_retries,
        }
    }
}

/// 哪一项预算先耗尽
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustedBy {
    /// 合计恢复次数上限
    Total,
    /// 当前分类的恢复次数上限
    Category(FailureCategory),
    /// 单 todo 总尝试次数上限
    Attempts,
}

impl ExhaustedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustedBy::Total => "TOTAL",
            ExhaustedBy::Category(FailureCategory::Static) => "STATIC",
            ExhaustedBy::Category(FailureCategory::Runtime) => "RUNTIME",
            ExhaustedBy::Category(FailureCategory::Semantic) => "SEMANTIC",
            ExhaustedBy::Attempts => "ATTEMPTS",
        }
    }
}

/// 恢复决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Retry,
    Exhausted(ExhaustedBy),
}

/// 恢复预算上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_retries_per_todo: u32,
    pub max_total_recovery_retries: u32,
    pub max_static_recovery_retries: u32,
    pub max_runtime_recovery_retries: u32,
    pub max_semantic_recovery_retries: u32,
}

impl RecoveryPolicy {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            max_retries_per_todo: config.max_retries_per_todo,
            max_total_recovery_retries: config.max_total_recovery_retries,
            max_static_recovery_retries: config.max_static_recovery_retries,
            max_runtime_recovery_retries: config.max_runtime_recovery_retries,
            max_semantic_recovery_retries: config.max_semantic_recovery_retries,
        }
    }

    fn category_limit(&self, category: FailureCategory) -> u32 {
        match category {
            FailureCategory::Static => self.max_static_recovery_retries,
            FailureCategory::Runtime => self.max_runtime_recovery_retries,
            FailureCategory::Semantic => self.max_semantic_recovery_retries,
        }
    }

    /// 在一次失败的尝试已计入 `budget.attempts` 之后调用
    ///
    /// 检查顺序固定（合计 → 分类 → 尝试次数），同样的配置与失败序列总是得到同样的结果。
    pub fn decide(&self, budget: &RetryBudget, category: FailureCategory) -> RecoveryDecision {
        if budget.total_retries >= self.max_total_recovery_retries {
            return RecoveryDecision::Exhausted(ExhaustedBy::Total);
        }
        if budget.used(category) >= self.category_limit(category) {
            return RecoveryDecision::Exhausted(ExhaustedBy::Category(category));
        }
        if budget.attempts >= self.max_retries_per_todo {
            return RecoveryDecision::Exhausted(ExhaustedBy::Attempts);
        }
        RecoveryDecision::Retry
    }
}
