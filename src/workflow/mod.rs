//! 工作流：todo 计划的数据模型、事件、协作方接口与线性执行器

pub mod builder;
pub mod collaborators;
pub mod engine;
pub mod events;
pub mod judge;
pub mod placeholder;
pub mod precheck;
pub mod prompts;
pub mod store;
pub mod types;

pub use builder::{params, TodoPlanBuilder};
pub use collaborators::{
    JudgeRequest, JudgeVerdict, PrecheckResult, RunControl, SemanticJudge, StaticPrecheck,
    SubAgentRequest, SubAgentResult, SubAgentRunner, WorkflowStateStore,
};
pub use engine::WorkflowExecutor;
pub use events::{ChannelEventSink, EventSink, EventType, RecordingEventSink, WorkflowEvent};
pub use judge::LlmSemanticJudge;
pub use placeholder::{collect_unresolved, UnresolvedPlaceholder};
pub use precheck::PythonStaticPrecheck;
pub use store::{CountdownRunControl, InMemoryStateStore, StaticRunControl};
pub use types::{
    ExecutionMode, TodoExecutionRecord, TodoItem, TodoPlan, TodoStatus, TodoType, ToolSpec,
    WorkflowExecutionResult, WorkflowOutcome, WorkflowRequest, WorkflowState,
};
