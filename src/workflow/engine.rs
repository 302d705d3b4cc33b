//! 工作流执行器
//!
//! 按计划顺序逐个执行 todo：运行控制检查 → 调用上限 → 静态预检 → 工具路由 → 语义评审。
//! 失败按 STATIC / RUNTIME / SEMANTIC 分类后交给恢复策略，允许时请求模型重写参数并重试；
//! 每个 todo 结束后保存检查点，被暂停的 run 可以从检查点继续。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use crate::config::{AppConfig, JudgeSection, LocalConfigLoader, WorkflowConfig, WorkflowSection};
use crate::core::{
    FailureCategory, InvocationContext, Phase, RecoveryDecision, RecoveryPolicy, RetryBudget,
    WorkflowError,
};
use crate::llm::{generate_with_timeout, LlmClient, LlmFactory, Message};
use crate::observability::{preview, LlmCallRecord, MetricsRegistry, ObservabilityRecorder};
use crate::tools::envelope;
use crate::tools::registry::{
    first_non_blank, DATASET_IDS_ALIASES, DATASET_ID_ALIASES, PYTHON_CODE_ALIASES,
};
use crate::tools::{ToolName, ToolRouter};
use crate::workflow::collaborators::{
    JudgeRequest, RunControl, SemanticJudge, StaticPrecheck, SubAgentRequest, SubAgentRunner,
    WorkflowStateStore,
};
use crate::workflow::events::{EventSink, EventType, WorkflowEvent};
use crate::workflow::judge::LlmSemanticJudge;
use crate::workflow::placeholder::{collect_unresolved, PARAM_PLACEHOLDER_UNRESOLVED};
use crate::workflow::precheck::PythonStaticPrecheck;
use crate::workflow::prompts::{
    extract_json, final_answer_user_message, recovery_user_payload, FINAL_ANSWER_SYSTEM_PROMPT,
    RECOVERY_SYSTEM_PROMPT,
};
use crate::workflow::types::{
    ExecutionMode, TodoExecutionRecord, TodoItem, TodoPlan, TodoStatus, TodoType,
    WorkflowExecutionResult, WorkflowOutcome, WorkflowRequest, WorkflowState,
};

const PREVIEW_CHARS: usize = 200;

/// 恢复调用实际使用的模型
struct RecoveryModel {
    client: Arc<dyn LlmClient>,
    endpoint_name: String,
    model_name: String,
    static_fix: bool,
}

/// 线性工作流执行器
pub struct WorkflowExecutor {
    router: Arc<ToolRouter>,
    state_store: Arc<dyn WorkflowStateStore>,
    run_control: Arc<dyn RunControl>,
    events: Arc<dyn EventSink>,
    observer: Arc<dyn ObservabilityRecorder>,
    precheck: Arc<dyn StaticPrecheck>,
    judge: Arc<dyn SemanticJudge>,
    sub_agent: Option<Arc<dyn SubAgentRunner>>,
    llm_factory: Option<Arc<dyn LlmFactory>>,
    metrics: Arc<MetricsRegistry>,
    workflow_section: WorkflowSection,
    judge_section: JudgeSection,
    local: Arc<LocalConfigLoader>,
    llm_timeout: Duration,
}

impl WorkflowExecutor {
    /// 默认使用 `PythonStaticPrecheck` 与基于 run 模型的 `LlmSemanticJudge`
    pub fn new(
        router: Arc<ToolRouter>,
        state_store: Arc<dyn WorkflowStateStore>,
        run_control: Arc<dyn RunControl>,
        events: Arc<dyn EventSink>,
        observer: Arc<dyn ObservabilityRecorder>,
        config: &AppConfig,
        local: Arc<LocalConfigLoader>,
    ) -> Self {
        let llm_timeout = Duration::from_secs(config.llm.request_timeout_secs.max(1));
        let judge = LlmSemanticJudge::new(config.judge.clone(), Arc::clone(&observer), llm_timeout);
        Self {
            router,
            state_store,
            run_control,
            events,
            observer,
            precheck: Arc::new(PythonStaticPrecheck::new()),
            judge: Arc::new(judge),
            sub_agent: None,
            llm_factory: None,
            metrics: Arc::new(MetricsRegistry::new()),
            workflow_section: config.workflow.clone(),
            judge_section: config.judge.clone(),
            local,
            llm_timeout,
        }
    }

    pub fn with_precheck(mut self, precheck: Arc<dyn StaticPrecheck>) -> Self {
        self.precheck = precheck;
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn SemanticJudge>) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_sub_agent(mut self, runner: Arc<dyn SubAgentRunner>) -> Self {
        self.sub_agent = Some(runner);
        self
    }

    /// 静态修复模型需要按 endpoint / model / 温度解析
    pub fn with_llm_factory(mut self, factory: Arc<dyn LlmFactory>) -> Self {
        self.llm_factory = Some(factory);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// 测试用：毫秒级模型超时
    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    /// 每次执行时重新合并静态配置与本地覆盖
    pub fn resolve_config(&self) -> WorkflowConfig {
        let local = self.local.current();
        WorkflowConfig::resolve(&self.workflow_section, &self.judge_section, local.as_deref())
    }

    fn emit(&self, request: &WorkflowRequest, event_type: EventType, payload: Value) {
        self.events.append(WorkflowEvent::new(
            request.run_id.clone(),
            request.user_id.clone(),
            event_type,
            payload,
        ));
    }

    /// 执行（或从检查点继续）一个 todo 计划
    ///
    /// todo 级别的失败不会返回 Err；只有请求非法或状态存储不可用时才返回错误。
    pub async fn execute(
        &self,
        request: WorkflowRequest,
    ) -> Result<WorkflowExecutionResult, WorkflowError> {
        if request.run_id.trim().is_empty() {
            return Err(WorkflowError::InvalidRequest("run_id is required".to_string()));
        }
        if request.user_id.trim().is_empty() {
            return Err(WorkflowError::InvalidRequest("user_id is required".to_string()));
        }

        let config = self.resolve_config();
        let policy = RecoveryPolicy::from_config(&config);
        let run_id = request.run_id.as_str();

        let state = self
            .state_store
            .load_workflow_state(run_id)
            .await?
            .unwrap_or_default();
        self.state_store
            .set_tool_call_count(run_id, state.tool_calls_used)
            .await?;

        let mut plan: TodoPlan = request.plan.clone();
        for done in &state.completed_items {
            if let Some(item) = plan.items.iter_mut().find(|i| i.id == done.id) {
                *item = done.clone();
            }
        }
        let mut processed: Vec<TodoItem> = state.completed_items.clone();
        let mut context = state.context.clone();
        let mut has_failure = processed.iter().any(|i| i.status == TodoStatus::Failed);

        tracing::info!(
            run_id,
            plan_id = %plan.plan_id,
            todos = plan.items.len(),
            start_index = state.current_index,
            max_tool_calls = config.max_tool_calls,
            fail_fast = config.fail_fast,
            "workflow execution started"
        );

        for idx in state.current_index..plan.items.len() {
            if !self.run_control.is_runnable(run_id, &request.user_id).await {
                let used = self.state_store.tool_call_count(run_id).await?;
                let paused = WorkflowState {
                    current_index: idx,
                    completed_items: processed.clone(),
                    context: context.clone(),
                    tool_calls_used: used,
                    saved_at: chrono::Utc::now().timestamp_millis(),
                };
                self.state_store.save_workflow_state(run_id, &paused).await?;
                self.emit(
                    &request,
                    EventType::WorkflowPaused,
                    json!({ "current_index": idx, "tool_calls_used": used }),
                );
                tracing::info!(run_id, current_index = idx, "workflow paused");
                return Ok(WorkflowExecutionResult {
                    success: false,
                    paused: true,
                    outcome: WorkflowOutcome::Paused,
                    failure_reason: String::new(),
                    final_answer: String::new(),
                    completed_items: processed,
                    plan,
                    context,
                    tool_calls_used: used,
                });
            }

            let record = {
                let item = &mut plan.items[idx];
                let record = self
                    .execute_todo_with_retry(&request, item, &context, &config, &policy)
                    .await?;
                item.completed_at = Some(chrono::Utc::now().timestamp_millis());
                item.result_summary = record.summary.clone();
                item.output = record.output.clone();
                record
            };
            let used = self.state_store.tool_call_count(run_id).await?;
            let item = &mut plan.items[idx];
            let todo_id = item.id.clone();

            if record.success {
                item.set_status(TodoStatus::Succeeded);
                self.emit(
                    &request,
                    EventType::TodoFinished,
                    json!({
                        "todo_id": todo_id,
                        "success": true,
                        "summary": record.summary,
                        "output_preview": preview(&record.output, PREVIEW_CHARS),
                        "tool_calls_used": used,
                    }),
                );
                context.insert(todo_id.clone(), record.clone());
            } else {
                item.set_status(TodoStatus::Failed);
                has_failure = true;
                self.emit(
                    &request,
                    EventType::TodoFailed,
                    json!({
                        "todo_id": todo_id,
                        "success": false,
                        "summary": record.summary,
                        "output_preview": preview(&record.output, PREVIEW_CHARS),
                        "failure_category": record.category().as_str(),
                        "tool_calls_used": used,
                    }),
                );
            }
            processed.push(item.clone());

            let checkpoint = WorkflowState {
                current_index: idx + 1,
                completed_items: processed.clone(),
                context: context.clone(),
                tool_calls_used: used,
                saved_at: chrono::Utc::now().timestamp_millis(),
            };
            self.state_store.save_workflow_state(run_id, &checkpoint).await?;

            if !record.success && config.fail_fast {
                for rest in plan.items.iter_mut().skip(idx + 1) {
                    if rest.set_status(TodoStatus::Skipped) {
                        self.emit(
                            &request,
                            EventType::TodoSkipped,
                            json!({ "todo_id": rest.id, "reason": "fail_fast", "failed_todo_id": todo_id }),
                        );
                    }
                }
                self.state_store.clear_workflow_state(run_id).await?;
                let final_answer = self.generate_final_answer(&request, &processed, &context).await;
                tracing::warn!(run_id, todo_id = %todo_id, "workflow aborted by fail-fast");
                return Ok(WorkflowExecutionResult {
                    success: false,
                    paused: false,
                    outcome: WorkflowOutcome::Aborted,
                    failure_reason: format!("todo_failed:{todo_id}"),
                    final_answer,
                    completed_items: processed,
                    plan,
                    context,
                    tool_calls_used: used,
                });
            }
        }

        self.state_store.clear_workflow_state(run_id).await?;
        let final_answer = self.generate_final_answer(&request, &processed, &context).await;
        let used = self.state_store.tool_call_count(run_id).await?;
        let (outcome, failure_reason) = if has_failure {
            (WorkflowOutcome::PartialFailure, "todo_partial_failed".to_string())
        } else {
            (WorkflowOutcome::Complete, String::new())
        };
        tracing::info!(run_id, ?outcome, tool_calls_used = used, "workflow execution finished");
        Ok(WorkflowExecutionResult {
            success: !has_failure,
            paused: false,
            outcome,
            failure_reason,
            final_answer,
            completed_items: processed,
            plan,
            context,
            tool_calls_used: used,
        })
    }

    async fn execute_todo_with_retry(
        &self,
        request: &WorkflowRequest,
        item: &mut TodoItem,
        context: &BTreeMap<String, TodoExecutionRecord>,
        config: &WorkflowConfig,
        policy: &RecoveryPolicy,
    ) -> Result<TodoExecutionRecord, WorkflowError> {
        let run_id = request.run_id.as_str();

        if matches!(item.todo_type, TodoType::Thought | TodoType::SubAgent) {
            item.set_status(TodoStatus::Running);
            self.emit(
                request,
                EventType::TodoStarted,
                json!({
                    "todo_id": item.id,
                    "sequence": item.sequence,
                    "type": item.todo_type.as_str(),
                    "tool": item.tool_name,
                }),
            );
            return self.execute_item(request, item, context, config).await;
        }

        let mut budget = RetryBudget::new();
        loop {
            item.set_status(TodoStatus::Running);
            self.emit(
                request,
                EventType::TodoStarted,
                json!({
                    "todo_id": item.id,
                    "sequence": item.sequence,
                    "type": item.todo_type.as_str(),
                    "tool": item.tool_name,
                    "attempt": budget.attempts + 1,
                }),
            );

            let record = self.execute_item(request, item, context, config).await?;
            if record.success {
                return Ok(record);
            }
            budget.record_failure();
            if record.unrecoverable {
                return Ok(record);
            }

            let category = record.category();
            if let RecoveryDecision::Exhausted(by) = policy.decide(&budget, category) {
                tracing::debug!(
                    run_id,
                    todo_id = %item.id,
                    %category,
                    exhausted_by = by.as_str(),
                    attempts = budget.attempts,
                    "todo retry budget exhausted"
                );
                self.emit(
                    request,
                    EventType::TodoRetryExhausted,
                    json!({
                        "todo_id": item.id,
                        "failure_category": category.as_str(),
                        "exhausted_by": by.as_str(),
                        "attempts": budget.attempts,
                        "static_recovery_attempts": budget.static_retries,
                        "runtime_recovery_attempts": budget.runtime_retries,
                        "semantic_recovery_attempts": budget.semantic_retries,
                        "total_recovery_attempts": budget.total_retries,
                    }),
                );
                return Ok(record);
            }

            let used = self.state_store.tool_call_count(run_id).await?;
            if used >= config.max_tool_calls {
                tracing::debug!(run_id, todo_id = %item.id, used, "tool call limit reached, no retry");
                return Ok(record);
            }

            let Some(new_params) = self
                .request_recovery_params(request, item, &record, context, config)
                .await
            else {
                return Ok(record);
            };

            item.params = new_params;
            budget.consume(category);
            self.observer.record_recovery_attempt(run_id, category);
            self.metrics.counter("workflow.recovery").increment();
            self.emit(
                request,
                EventType::TodoRetry,
                json!({
                    "todo_id": item.id,
                    "attempt": budget.attempts + 1,
                    "tool_calls_used": used,
                    "failure_category": category.as_str(),
                    "static_recovery_attempts": budget.static_retries,
                    "runtime_recovery_attempts": budget.runtime_retries,
                    "semantic_recovery_attempts": budget.semantic_retries,
                    "total_recovery_attempts": budget.total_retries,
                }),
            );
        }
    }

    async fn execute_item(
        &self,
        request: &WorkflowRequest,
        item: &TodoItem,
        context: &BTreeMap<String, TodoExecutionRecord>,
        config: &WorkflowConfig,
    ) -> Result<TodoExecutionRecord, WorkflowError> {
        let run_id = request.run_id.as_str();
        let mode = item.execution_mode.unwrap_or(config.default_execution_mode);

        if item.todo_type == TodoType::Thought {
            return Ok(TodoExecutionRecord::succeeded(
                item.reasoning.clone(),
                item.reasoning.clone(),
                0,
            ));
        }
        if item.todo_type == TodoType::SubAgent || mode == ExecutionMode::ForceSubAgent {
            return self.run_sub_agent(request, item, context, config).await;
        }

        let used = self.state_store.tool_call_count(run_id).await?;
        if used >= config.max_tool_calls {
            self.emit(
                request,
                EventType::ToolCallLimitReached,
                json!({ "todo_id": item.id, "limit": config.max_tool_calls, "used": used }),
            );
            let mut record = TodoExecutionRecord::failed(
                "",
                "tool_call_limit_reached",
                0,
                FailureCategory::Runtime,
            );
            record.unrecoverable = true;
            return Ok(record);
        }

        let tool_name = item.tool_name.trim();
        let unresolved = collect_unresolved(&item.params);
        if let Some(first) = unresolved.first() {
            let summary = format!(
                "{PARAM_PLACEHOLDER_UNRESOLVED}: tool={tool_name}, param={}, placeholder={}",
                first.param_key, first.raw_placeholder
            );
            tracing::debug!(run_id, todo_id = %item.id, %summary, "unresolved placeholder in params");
            self.emit(
                request,
                EventType::ToolCallPlaceholderUnresolved,
                json!({
                    "todo_id": item.id,
                    "tool_name": tool_name,
                    "error_category": PARAM_PLACEHOLDER_UNRESOLVED,
                    "unresolved_placeholders": unresolved,
                }),
            );
            return Ok(TodoExecutionRecord::failed("", summary, 0, FailureCategory::Runtime));
        }

        let known = ToolName::parse(tool_name);
        self.emit(
            request,
            EventType::ToolCallStarted,
            json!({
                "todo_id": item.id,
                "tool_name": tool_name,
                "displayName": known.map(|t| t.display_name()).unwrap_or(tool_name),
                "description": known.map(|t| t.description()).unwrap_or(""),
                "parameters": item.params,
            }),
        );

        let code_execution = item.is_code_execution();
        let code = first_non_blank(&item.params, PYTHON_CODE_ALIASES).unwrap_or_default();
        if code_execution && config.static_precheck_enabled {
            let dataset_refs = first_non_blank(&item.params, DATASET_ID_ALIASES)
                .or_else(|| first_non_blank(&item.params, DATASET_IDS_ALIASES))
                .unwrap_or_default();
            let precheck = self.precheck.check(&code, &dataset_refs, &item.params);
            if !precheck.passed {
                let summary = format!("{}: {}", precheck.error_code, precheck.message);
                self.emit(
                    request,
                    EventType::ToolCallStaticPrecheckFailed,
                    json!({
                        "todo_id": item.id,
                        "tool_name": tool_name,
                        "error_category": FailureCategory::Static.as_str(),
                        "summary": summary,
                        "report": precheck.report,
                    }),
                );
                let mut record = TodoExecutionRecord::failed(
                    "",
                    summary,
                    0,
                    precheck.category.unwrap_or(FailureCategory::Static),
                );
                record.precheck_report = Some(precheck.report);
                return Ok(record);
            }
        }

        let ctx = InvocationContext::new(run_id, request.user_id.as_str())
            .with_phase(Phase::ToolExecution)
            .with_todo(item.id.as_str());
        let result = self
            .router
            .invoke_with_meta(Some(&ctx), tool_name, &item.params)
            .await;
        self.state_store.increment_tool_call_count(run_id, 1).await?;

        let cache_hit = result.cache_meta.as_ref().is_some_and(|m| m.hit);
        self.emit(
            request,
            EventType::ToolCallFinished,
            json!({
                "todo_id": item.id,
                "tool_name": tool_name,
                "success": result.success,
                "cacheHit": cache_hit,
                "duration_ms": result.duration_ms,
                "result_preview": preview(&result.output, PREVIEW_CHARS),
                "cache": ToolRouter::event_cache_payload(Some(&result)),
            }),
        );

        if !result.success {
            return Ok(TodoExecutionRecord::failed(
                result.output.clone(),
                preview(&result.output, PREVIEW_CHARS),
                1,
                FailureCategory::Runtime,
            ));
        }

        if code_execution && config.semantic_judge_enabled {
            let tool_output = envelope::parse_object(&result.output)
                .map(Value::Object)
                .unwrap_or_else(|| Value::Object(Map::new()));
            let verdict = self
                .judge
                .judge(JudgeRequest {
                    run_id: request.run_id.clone(),
                    user_goal: request.user_goal.clone(),
                    todo_id: item.id.clone(),
                    tool_name: tool_name.to_string(),
                    todo_reasoning: item.reasoning.clone(),
                    run_args: item.params.clone(),
                    code,
                    tool_output,
                    fallback_model: Arc::clone(&request.model),
                    fallback_endpoint_name: request.endpoint_name.clone(),
                    fallback_model_name: request.model_name.clone(),
                })
                .await;
            self.observer.record_semantic_judge_call(run_id, !verdict.pass);
            if !verdict.pass {
                self.emit(
                    request,
                    EventType::SemanticJudgeRejected,
                    json!({
                        "todo_id": item.id,
                        "category": verdict.category,
                        "severity": verdict.severity,
                        "reason": verdict.reason,
                    }),
                );
                let mut record = TodoExecutionRecord::failed(
                    result.output,
                    format!("SEMANTIC_JUDGE_REJECTED: {}, {}", verdict.category, verdict.reason),
                    1,
                    FailureCategory::Semantic,
                );
                record.semantic_judge_report = Some(verdict.report);
                return Ok(record);
            }
            let summary = preview(&result.output, PREVIEW_CHARS);
            let mut record = TodoExecutionRecord::succeeded(result.output, summary, 1);
            record.semantic_judge_report = Some(verdict.report);
            return Ok(record);
        }

        let summary = preview(&result.output, PREVIEW_CHARS);
        Ok(TodoExecutionRecord::succeeded(result.output, summary, 1))
    }

    async fn run_sub_agent(
        &self,
        request: &WorkflowRequest,
        item: &TodoItem,
        context: &BTreeMap<String, TodoExecutionRecord>,
        config: &WorkflowConfig,
    ) -> Result<TodoExecutionRecord, WorkflowError> {
        let runner = match (&self.sub_agent, config.sub_agent_enabled) {
            (Some(runner), true) => Arc::clone(runner),
            (_, false) => {
                return Ok(TodoExecutionRecord::failed(
                    "",
                    "sub_agent_disabled",
                    0,
                    FailureCategory::Runtime,
                ))
            }
            (None, true) => {
                return Ok(TodoExecutionRecord::failed(
                    "",
                    "sub_agent_unavailable",
                    0,
                    FailureCategory::Runtime,
                ))
            }
        };

        self.emit(
            request,
            EventType::SubAgentStarted,
            json!({ "todo_id": item.id, "goal": item.reasoning }),
        );
        let goal = if item.reasoning.trim().is_empty() {
            format!("请完成任务: {}", item.id)
        } else {
            item.reasoning.clone()
        };
        let sub_context = json!({
            "user_goal": request.user_goal,
            "resolved_params": item.params,
            "done": context,
        });
        let sub_request = SubAgentRequest {
            run_id: request.run_id.clone(),
            user_id: request.user_id.clone(),
            task_id: item.id.clone(),
            goal,
            context: sub_context.to_string(),
            seed_args: item.params.clone(),
            tool_whitelist: request.tool_specs.iter().map(|s| s.name.clone()).collect(),
            max_steps: config.max_tool_calls_per_sub_agent.min(config.sub_agent_max_steps),
            endpoint_name: request.endpoint_name.clone(),
            model_name: request.model_name.clone(),
        };
        let result = runner.run(sub_request, Arc::clone(&request.model)).await;

        let used_calls = result.steps.max(1);
        self.state_store
            .increment_tool_call_count(&request.run_id, used_calls)
            .await?;
        self.emit(
            request,
            EventType::SubAgentFinished,
            json!({
                "todo_id": item.id,
                "success": result.success,
                "tool_calls_used": used_calls,
                "summary": preview(&result.answer, PREVIEW_CHARS),
            }),
        );

        if result.success {
            let summary = preview(&result.answer, PREVIEW_CHARS);
            Ok(TodoExecutionRecord::succeeded(result.answer, summary, used_calls))
        } else {
            Ok(TodoExecutionRecord::failed(
                result.error.clone(),
                result.error,
                used_calls,
                FailureCategory::Runtime,
            ))
        }
    }

    fn resolve_recovery_model(
        &self,
        request: &WorkflowRequest,
        category: FailureCategory,
        config: &WorkflowConfig,
    ) -> RecoveryModel {
        if category == FailureCategory::Static && !config.static_fix_model.is_empty() {
            match self.llm_factory.as_ref() {
                Some(factory) => match factory.resolve(
                    &config.static_fix_endpoint,
                    &config.static_fix_model,
                    config.static_fix_temperature,
                ) {
                    Ok(resolved) => {
                        return RecoveryModel {
                            client: resolved.client,
                            endpoint_name: resolved.endpoint_name,
                            model_name: resolved.model_name,
                            static_fix: true,
                        }
                    }
                    Err(e) => tracing::warn!(
                        endpoint = %config.static_fix_endpoint,
                        model = %config.static_fix_model,
                        error = %e,
                        "failed to init static fix model, fallback to run model"
                    ),
                },
                None => tracing::warn!(
                    model = %config.static_fix_model,
                    "static fix model configured without llm factory, fallback to run model"
                ),
            }
        }
        RecoveryModel {
            client: Arc::clone(&request.model),
            endpoint_name: request.endpoint_name.clone(),
            model_name: request.model_name.clone(),
            static_fix: false,
        }
    }

    /// 请求模型重写失败 todo 的参数；放弃、解析失败或调用失败都返回 None
    async fn request_recovery_params(
        &self,
        request: &WorkflowRequest,
        item: &TodoItem,
        failed: &TodoExecutionRecord,
        context: &BTreeMap<String, TodoExecutionRecord>,
        config: &WorkflowConfig,
    ) -> Option<Map<String, Value>> {
        let category = failed.category();
        self.emit(
            request,
            EventType::TodoRecoveryStarted,
            json!({
                "todo_id": item.id,
                "tool": item.tool_name,
                "error_preview": preview(&failed.summary, PREVIEW_CHARS),
                "error_category": category.as_str(),
            }),
        );

        let payload = recovery_user_payload(&request.user_goal, item, failed, context);
        let messages = vec![
            Message::system(RECOVERY_SYSTEM_PROMPT),
            Message::user(payload.to_string()),
        ];
        let model = self.resolve_recovery_model(request, category, config);
        let started = Instant::now();
        let generation =
            match generate_with_timeout(model.client.as_ref(), &messages, self.llm_timeout).await {
                Ok(g) => g,
                Err(e) => {
                    tracing::warn!(run_id = %request.run_id, todo_id = %item.id, error = %e, "recovery model call failed");
                    return None;
                }
            };
        self.observer.record_llm_call(&LlmCallRecord {
            run_id: request.run_id.clone(),
            stage: "workflow_todo_recovery".to_string(),
            endpoint_name: model.endpoint_name.clone(),
            model_name: model.model_name.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            token_usage: generation.token_usage,
            response_preview: preview(&generation.text, PREVIEW_CHARS),
        });
        self.emit(
            request,
            EventType::TodoRecoveryCompleted,
            json!({
                "todo_id": item.id,
                "response_preview": preview(&generation.text, PREVIEW_CHARS),
                "error_category": category.as_str(),
                "recovery_model": model.model_name,
                "recovery_endpoint": model.endpoint_name,
                "using_static_fix_model": model.static_fix,
            }),
        );

        let parsed = match extract_json(&generation.text).map(serde_json::from_str::<Value>) {
            Some(Ok(Value::Object(map))) => map,
            Some(Err(e)) => {
                tracing::warn!(todo_id = %item.id, error = %e, "failed to parse recovery response");
                return None;
            }
            _ => return None,
        };
        if parsed.get("abandon").and_then(Value::as_bool) == Some(true) {
            tracing::info!(todo_id = %item.id, "recovery abandoned by model");
            return None;
        }
        match parsed.get("params") {
            Some(Value::Object(params)) if !params.is_empty() => Some(params.clone()),
            _ => None,
        }
    }

    async fn generate_final_answer(
        &self,
        request: &WorkflowRequest,
        processed: &[TodoItem],
        context: &BTreeMap<String, TodoExecutionRecord>,
    ) -> String {
        self.emit(
            request,
            EventType::FinalAnswerGenerating,
            json!({ "completed_items": processed.len() }),
        );
        let messages = vec![
            Message::system(FINAL_ANSWER_SYSTEM_PROMPT),
            Message::user(final_answer_user_message(&request.user_goal, processed, context)),
        ];
        let started = Instant::now();
        let answer =
            match generate_with_timeout(request.model.as_ref(), &messages, self.llm_timeout).await {
                Ok(generation) => {
                    self.observer.record_llm_call(&LlmCallRecord {
                        run_id: request.run_id.clone(),
                        stage: "workflow_final_answer".to_string(),
                        endpoint_name: request.endpoint_name.clone(),
                        model_name: request.model_name.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        token_usage: generation.token_usage,
                        response_preview: preview(&generation.text, PREVIEW_CHARS),
                    });
                    generation.text
                }
                Err(e) => {
                    tracing::warn!(run_id = %request.run_id, error = %e, "final answer generation failed");
                    String::new()
                }
            };
        self.emit(
            request,
            EventType::FinalAnswerCompleted,
            json!({
                "answer_preview": preview(&answer, PREVIEW_CHARS),
                "endpoint": request.endpoint_name,
                "model": request.model_name,
            }),
        );
        answer
    }
}
