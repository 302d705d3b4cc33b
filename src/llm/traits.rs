//! LLM 能力抽象
//!
//! 推理调用本身是外部能力：消息进、文本出。执行器只依赖 `LlmClient::generate`；
//! 静态修复（STATIC 分类恢复）可能需要另一个 endpoint / 模型 / 温度，由 `LlmFactory` 解析。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::llm::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model resolution failed: {0}")]
    Resolve(String),
}

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 单次生成结果
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub token_usage: TokenUsage,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            token_usage: TokenUsage::default(),
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, messages: &[Message]) -> Result<Generation, LlmError>;
}

/// 解析后的模型：客户端 + endpoint / 模型标识（用于观测与事件）
#[derive(Clone)]
pub struct ResolvedModel {
    pub client: Arc<dyn LlmClient>,
    pub endpoint_name: String,
    pub endpoint_base_url: String,
    pub model_name: String,
}

/// 按 endpoint / 模型 / 温度构造客户端（外部协作方）
pub trait LlmFactory: Send + Sync {
    fn resolve(
        &self,
        endpoint: &str,
        model: &str,
        temperature: Option<f64>,
    ) -> Result<ResolvedModel, LlmError>;
}

/// 在超时内调用 generate；超时转为 `LlmError::Timeout`
pub async fn generate_with_timeout(
    client: &dyn LlmClient,
    messages: &[Message],
    limit: Duration,
) -> Result<Generation, LlmError> {
    match tokio::time::timeout(limit, client.generate(messages)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(limit)),
    }
}
