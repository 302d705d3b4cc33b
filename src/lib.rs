//! Frog Agent - Todo 工作流执行与恢复引擎
//!
//! 模块划分：
//! - **cache**: 工具结果缓存（缓存计划 / key 归一化、远程存储抽象、命中与自愈）
//! - **config**: 应用配置加载（TOML + 环境变量）与可热加载的本地覆盖
//! - **core**: 错误类型、失败分类与恢复预算、调用上下文
//! - **llm**: 模型调用抽象（消息、客户端、模型解析）与 Mock
//! - **observability**: tracing 初始化、调用观测记录、指标
//! - **tools**: 工具表与参数别名、结构化信封、后端抽象、路由（含故障注入）
//! - **workflow**: todo 计划、事件、协作方接口、线性执行器

pub mod cache;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod tools;
pub mod workflow;

pub use config::{load_config, AppConfig, LocalConfigLoader};
pub use workflow::{WorkflowExecutionResult, WorkflowExecutor, WorkflowRequest};
