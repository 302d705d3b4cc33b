//! 集成测试共用的装配代码

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use frog_agent::cache::{InMemoryCache, ToolResultCache};
use frog_agent::config::{AppConfig, LocalConfigLoader};
use frog_agent::llm::{LlmClient, LlmError, LlmFactory, MockLlmClient, ResolvedModel};
use frog_agent::observability::{MetricsRegistry, RecordingObserver};
use frog_agent::tools::{StaticMarketData, StaticSandbox, ToolRouter};
use frog_agent::workflow::{
    InMemoryStateStore, JudgeRequest, JudgeVerdict, RecordingEventSink, RunControl,
    SemanticJudge, StaticRunControl, SubAgentRequest, SubAgentResult, SubAgentRunner, TodoPlan,
    ToolSpec, WorkflowExecutor, WorkflowRequest,
};

pub const RUN_ID: &str = "run-1";
pub const USER_ID: &str = "user-1";

pub struct Harness {
    pub config: AppConfig,
    pub market: Arc<StaticMarketData>,
    pub sandbox: Arc<StaticSandbox>,
    pub cache_store: Arc<InMemoryCache>,
    pub cache: Arc<ToolResultCache>,
    pub router: Arc<ToolRouter>,
    pub store: Arc<InMemoryStateStore>,
    pub events: Arc<RecordingEventSink>,
    pub observer: Arc<RecordingObserver>,
    pub metrics: Arc<MetricsRegistry>,
    pub local: Arc<LocalConfigLoader>,
}

impl Harness {
    pub fn new(config: AppConfig) -> Self {
        let market = Arc::new(StaticMarketData::default());
        let sandbox = Arc::new(StaticSandbox::default());
        let cache_store = Arc::new(InMemoryCache::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let observer = Arc::new(RecordingObserver::default());
        let local = Arc::new(LocalConfigLoader::in_memory(None));
        let cache = Arc::new(ToolResultCache::new(
            cache_store.clone(),
            config.cache.clone(),
            local.clone(),
            metrics.clone(),
        ));
        let router = Arc::new(ToolRouter::new(
            market.clone(),
            sandbox.clone(),
            cache.clone(),
            observer.clone(),
            metrics.clone(),
            config.tools.timeout_secs,
        ));
        Self {
            config,
            market,
            sandbox,
            cache_store,
            cache,
            router,
            store: Arc::new(InMemoryStateStore::new()),
            events: Arc::new(RecordingEventSink::new()),
            observer,
            metrics,
            local,
        }
    }

    pub fn executor(&self) -> WorkflowExecutor {
        self.executor_with(Arc::new(StaticRunControl::new(true)))
    }

    pub fn executor_with(&self, run_control: Arc<dyn RunControl>) -> WorkflowExecutor {
        WorkflowExecutor::new(
            self.router.clone(),
            self.store.clone(),
            run_control,
            self.events.clone(),
            self.observer.clone(),
            &self.config,
            self.local.clone(),
        )
        .with_metrics(self.metrics.clone())
        .with_llm_timeout(Duration::from_secs(5))
    }
}

pub fn request(plan: TodoPlan, model: Arc<dyn LlmClient>) -> WorkflowRequest {
    WorkflowRequest {
        run_id: RUN_ID.to_string(),
        user_id: USER_ID.to_string(),
        user_goal: "分析浦发银行近一个月走势".to_string(),
        plan,
        model,
        tool_specs: ToolSpec::supported(),
        endpoint_name: "default".to_string(),
        endpoint_base_url: "http://localhost".to_string(),
        model_name: "mock-model".to_string(),
    }
}

pub fn params(value: Value) -> Map<String, Value> {
    frog_agent::workflow::params(value)
}

pub fn summary_model() -> Arc<MockLlmClient> {
    Arc::new(MockLlmClient::new("最终总结"))
}

pub fn python_params() -> Map<String, Value> {
    params(json!({
        "code": "import pandas as pd\nprint(1)",
        "dataset_id": "600000_SH_20240101_20240131",
    }))
}

/// 按顺序返回预置结论的评审
#[derive(Default)]
pub struct ScriptedJudge {
    verdicts: Mutex<VecDeque<JudgeVerdict>>,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    pub fn new(verdicts: Vec<JudgeVerdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SemanticJudge for ScriptedJudge {
    async fn judge(&self, _request: JudgeRequest) -> JudgeVerdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| JudgeVerdict::pass("OK", "", json!({})))
    }
}

/// 固定结果的子 Agent
pub struct FixedSubAgent {
    pub result: SubAgentResult,
    pub requests: Mutex<Vec<SubAgentRequest>>,
}

impl FixedSubAgent {
    pub fn new(result: SubAgentResult) -> Self {
        Self {
            result,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SubAgentRunner for FixedSubAgent {
    async fn run(&self, request: SubAgentRequest, _model: Arc<dyn LlmClient>) -> SubAgentResult {
        self.requests.lock().unwrap().push(request);
        self.result.clone()
    }
}

/// 只认识一个模型名的工厂
pub struct SingleModelFactory {
    pub model_name: String,
    pub client: Arc<MockLlmClient>,
}

impl LlmFactory for SingleModelFactory {
    fn resolve(
        &self,
        endpoint: &str,
        model: &str,
        _temperature: Option<f64>,
    ) -> Result<ResolvedModel, LlmError> {
        if model != self.model_name {
            return Err(LlmError::Resolve(format!("unknown model {model}")));
        }
        Ok(ResolvedModel {
            client: self.client.clone(),
            endpoint_name: endpoint.to_string(),
            endpoint_base_url: "http://fix.local".to_string(),
            model_name: model.to_string(),
        })
    }
}
