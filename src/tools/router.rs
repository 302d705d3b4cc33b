//! 工具路由：参数别名归一 → 缓存 → 后端调用，附带故障注入、超时、观测与指标
//!
//! 路由对调用方永远返回统一信封文本，不会返回 Err：未知工具、后端错误、超时、中断都会变成失败信封。

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::backend::{CodeSandbox, MarketDataTools};
use super::envelope;
use super::registry::{ToolArgs, ToolName};
use crate::cache::{CacheMeta, ToolExecutionOutcome, ToolResultCache};
use crate::config::FaultInjectionSection;
use crate::core::{InvocationContext, ToolError};
use crate::observability::{preview, MetricsRegistry, ObservabilityRecorder, ToolCallRecord};

/// 一次工具调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocationResult {
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
    pub cache_meta: Option<CacheMeta>,
}

pub struct ToolRouter {
    market: Arc<dyn MarketDataTools>,
    sandbox: Arc<dyn CodeSandbox>,
    cache: Arc<ToolResultCache>,
    observer: Arc<dyn ObservabilityRecorder>,
    metrics: Arc<MetricsRegistry>,
    fault_injection: FaultInjectionSection,
    timeout: Duration,
    /// 触发过一次后换成新令牌，只中断当时在途的调用
    cancel: Mutex<CancellationToken>,
}

impl ToolRouter {
    pub fn new(
        market: Arc<dyn MarketDataTools>,
        sandbox: Arc<dyn CodeSandbox>,
        cache: Arc<ToolResultCache>,
        observer: Arc<dyn ObservabilityRecorder>,
        metrics: Arc<MetricsRegistry>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            market,
            sandbox,
            cache,
            observer,
            metrics,
            fault_injection: FaultInjectionSection::default(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_fault_injection(mut self, fault_injection: FaultInjectionSection) -> Self {
        self.fault_injection = fault_injection;
        self
    }

    /// 测试用：毫秒级超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Mutex::new(cancel);
        self
    }

    /// 当前取消令牌：cancel 后正在进行的注入延迟以 INTERRUPTED 结束，
    /// 之后的调用使用新令牌，不受影响
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|_| CancellationToken::new())
    }

    /// 已触发的令牌换成新的
    fn rearm_cancellation(&self) {
        if let Ok(mut cancel) = self.cancel.lock() {
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }
    }

    pub fn supported_tools(&self) -> Vec<&'static str> {
        ToolName::ALL.iter().map(ToolName::as_str).collect()
    }

    pub fn event_cache_payload(result: Option<&ToolInvocationResult>) -> Value {
        CacheMeta::payload_of(result.and_then(|r| r.cache_meta.as_ref()))
    }

    pub async fn invoke(
        &self,
        ctx: Option<&InvocationContext>,
        tool_name: &str,
        params: &Map<String, Value>,
    ) -> String {
        self.invoke_with_meta(ctx, tool_name, params).await.output
    }

    pub async fn invoke_with_meta(
        &self,
        ctx: Option<&InvocationContext>,
        tool_name: &str,
        params: &Map<String, Value>,
    ) -> ToolInvocationResult {
        let run_id = ctx.map(|c| c.run_id.as_str()).unwrap_or_default();
        let params_json = Value::Object(params.clone());
        tracing::debug!(run_id, tool = tool_name, params = %params_json, "tool invoke request");

        if let Some(interrupted) = self.inject_latency(tool_name).await {
            return self.finish(ctx, tool_name, params, interrupted);
        }

        if self.fault_injection.failure_rate > 0.0
            && rand::random::<f64>() < self.fault_injection.failure_rate
        {
            let output = envelope::failure(
                tool_name,
                envelope::TOOL_INVOCATION_ERROR,
                "Simulated failure for stress test",
                json!({}),
            );
            return self.finish(ctx, tool_name, params, uncached(output, 0));
        }

        let Some(tool) = ToolName::parse(tool_name.trim()) else {
            let output = envelope::failure(
                tool_name,
                envelope::UNSUPPORTED_TOOL,
                &format!("Unsupported tool: {tool_name}"),
                json!({ "tool": tool_name }),
            );
            return self.finish(ctx, tool_name, params, uncached(output, 0));
        };

        let args = ToolArgs::from_params(tool, params);
        let scope = ctx
            .map(InvocationContext::cache_scope)
            .unwrap_or_else(|| "global".to_string());
        let cached = self
            .cache
            .execute_with_cache(tool.as_str(), params, &scope, || {
                Box::pin(self.execute_direct(tool, &args))
            })
            .await;

        self.finish(
            ctx,
            tool_name,
            params,
            ToolInvocationResult {
                output: cached.result,
                success: cached.success,
                duration_ms: cached.duration_ms,
                cache_meta: Some(cached.cache_meta),
            },
        )
    }

    /// 注入固定延迟；等待期间被取消则返回 INTERRUPTED 结果。
    /// 调用开始前已触发的取消不影响本次调用
    async fn inject_latency(&self, tool_name: &str) -> Option<ToolInvocationResult> {
        if !self.fault_injection.latency_enabled || self.fault_injection.latency_ms == 0 {
            return None;
        }
        let latency = Duration::from_millis(self.fault_injection.latency_ms);
        self.rearm_cancellation();
        let cancel = self.cancellation_token();
        tokio::select! {
            _ = tokio::time::sleep(latency) => None,
            _ = cancel.cancelled() => {
                self.rearm_cancellation();
                let err = ToolError::Interrupted("injected latency interrupted".to_string());
                let output = envelope::failure(tool_name, err.code(), &err.to_string(), json!({}));
                Some(uncached(output, 0))
            }
        }
    }

    /// 真实调用后端；后端错误与超时以 Err 返回，由缓存层合成失败信封
    async fn execute_direct(
        &self,
        tool: ToolName,
        args: &ToolArgs,
    ) -> Result<ToolExecutionOutcome, ToolError> {
        let started = Instant::now();
        let call = async {
            match (tool, args) {
                (ToolName::SearchStock, ToolArgs::Search { keyword }) => {
                    self.market.search_stock(keyword).await
                }
                (ToolName::SearchFund, ToolArgs::Search { keyword }) => {
                    self.market.search_fund(keyword).await
                }
                (ToolName::SearchIndex, ToolArgs::Search { keyword }) => {
                    self.market.search_index(keyword).await
                }
                (ToolName::GetStockInfo, ToolArgs::Info { ts_code }) => {
                    self.market.get_stock_info(ts_code).await
                }
                (ToolName::GetIndexInfo, ToolArgs::Info { ts_code }) => {
                    self.market.get_index_info(ts_code).await
                }
                (
                    ToolName::GetStockDaily,
                    ToolArgs::Daily {
                        ts_code,
                        start_date,
                        end_date,
                    },
                ) => {
                    self.market
                        .get_stock_daily(ts_code, start_date, end_date)
                        .await
                }
                (
                    ToolName::GetIndexDaily,
                    ToolArgs::Daily {
                        ts_code,
                        start_date,
                        end_date,
                    },
                ) => {
                    self.market
                        .get_index_daily(ts_code, start_date, end_date)
                        .await
                }
                (ToolName::ExecutePython, ToolArgs::Python(py)) => {
                    self.sandbox.execute_python(py).await
                }
                _ => Err(ToolError::InvalidArgs(format!(
                    "arguments do not match tool {tool}"
                ))),
            }
        };
        let output = match timeout(self.timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ToolError::Timeout(format!(
                    "{tool} exceeded {}ms",
                    self.timeout.as_millis()
                )))
            }
        };
        Ok(ToolExecutionOutcome {
            success: envelope::is_ok(&output),
            result: output,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// 统一收尾：观测上报 + 计时器
    fn finish(
        &self,
        ctx: Option<&InvocationContext>,
        tool_name: &str,
        params: &Map<String, Value>,
        result: ToolInvocationResult,
    ) -> ToolInvocationResult {
        self.metrics
            .tagged_timer("tool.call", "toolName", tool_name)
            .record_ms(result.duration_ms);

        if let Some(ctx) = ctx.filter(|c| !c.run_id.trim().is_empty()) {
            let normalized = ToolName::parse(tool_name.trim())
                .map(|tool| ToolArgs::from_params(tool, params).to_value())
                .unwrap_or_else(|| Value::Object(params.clone()));
            self.observer.record_tool_call(&ToolCallRecord {
                run_id: ctx.run_id.clone(),
                phase: ctx.phase.as_str().to_string(),
                tool_name: tool_name.to_string(),
                params: normalized,
                output: result.output.clone(),
                duration_ms: result.duration_ms,
                success: result.success,
                cache: result.cache_meta.clone().unwrap_or_default(),
                error: (!result.success).then(|| result.output.clone()),
            });
        }

        tracing::debug!(
            tool = tool_name,
            success = result.success,
            duration_ms = result.duration_ms,
            cache = %CacheMeta::payload_of(result.cache_meta.as_ref()),
            result_preview = %preview(&result.output, 500),
            "tool invoke response"
        );
        result
    }
}

fn uncached(output: String, duration_ms: u64) -> ToolInvocationResult {
    ToolInvocationResult {
        output,
        success: false,
        duration_ms,
        cache_meta: None,
    }
}
