//! LLM 层：消息类型、客户端抽象、模型解析与 Mock

pub mod message;
pub mod mock;
pub mod traits;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use traits::{
    generate_with_timeout, Generation, LlmClient, LlmError, LlmFactory, ResolvedModel, TokenUsage,
};
