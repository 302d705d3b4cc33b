//! 核心层：错误类型、失败分类与恢复预算、调用上下文

pub mod context;
pub mod error;
pub mod recovery;

pub use context::{scope_for_user, InvocationContext, Phase};
pub use error::{CacheError, ToolError, WorkflowError};
pub use recovery::{ExhaustedBy, FailureCategory, RecoveryDecision, RecoveryPolicy, RetryBudget};
