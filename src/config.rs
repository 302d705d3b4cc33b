//! 应用配置：静态默认（config/default.toml + 环境变量）与可热加载的本地运行时覆盖
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FROG__*` 覆盖（双下划线表示嵌套，如 `FROG__WORKFLOW__FAIL_FAST=true`）。
//! 运行时覆盖（`RuntimeOverrides`）由 `LocalConfigLoader` 持有，可随时 reload；
//! 「本地值有效则用本地值，否则回退静态默认」的合并逻辑都是纯函数，见 `CacheTtlConfig::resolve` 与 `WorkflowConfig::resolve`。

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use thiserror::Error;

use crate::workflow::ExecutionMode;

/// 配置加载错误
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheSection,
    pub workflow: WorkflowSection,
    pub judge: JudgeSection,
    pub tools: ToolsSection,
    pub llm: LlmSection,
    pub fault_injection: FaultInjectionSection,
}

/// [cache] 段：缓存格式版本与三类 TTL（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub version: String,
    pub search_ttl_seconds: i64,
    pub info_ttl_seconds: i64,
    pub dataset_ttl_seconds: i64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            search_ttl_seconds: 3600,
            info_ttl_seconds: 21600,
            dataset_ttl_seconds: 604800,
        }
    }
}

/// [workflow] 段：工具调用上限、重试预算、fail-fast、静态修复模型、子 Agent
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub max_tool_calls: i64,
    pub max_tool_calls_per_sub_agent: i64,
    pub fail_fast: bool,
    pub default_execution_mode: String,
    pub sub_agent_enabled: bool,
    pub sub_agent_max_steps: i64,
    /// 单个 todo 的总尝试次数上限（含首次）
    pub max_retries_per_todo: i64,
    /// 未设置时取 max_retries_per_todo - 1
    pub max_total_recovery_retries: Option<i64>,
    /// 三类预算未设置时都取 max_total_recovery_retries
    pub max_static_recovery_retries: Option<i64>,
    pub max_runtime_recovery_retries: Option<i64>,
    pub max_semantic_recovery_retries: Option<i64>,
    pub static_precheck_enabled: bool,
    pub static_fix_endpoint: Option<String>,
    pub static_fix_model: Option<String>,
    pub static_fix_temperature: Option<f64>,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_tool_calls: 20,
            max_tool_calls_per_sub_agent: 10,
            fail_fast: false,
            default_execution_mode: "AUTO".to_string(),
            sub_agent_enabled: true,
            sub_agent_max_steps: 6,
            max_retries_per_todo: 3,
            max_total_recovery_retries: None,
            max_static_recovery_retries: None,
            max_runtime_recovery_retries: None,
            max_semantic_recovery_retries: None,
            static_precheck_enabled: true,
            static_fix_endpoint: None,
            static_fix_model: None,
            static_fix_temperature: None,
        }
    }
}

/// [judge] 段：语义评审开关、模型不可用时是否放行、评审输出解析失败时的重试次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JudgeSection {
    pub semantic_enabled: bool,
    pub fail_open: bool,
    pub max_attempts: u32,
    /// 结论为 INSUFFICIENT_EVIDENCE 的驳回是否真正拦截（默认放行）
    pub block_on_insufficient_evidence: bool,
    /// 专用评审模型；为空时使用 run 模型
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub temperature: f64,
}

impl Default for JudgeSection {
    fn default() -> Self {
        Self {
            semantic_enabled: false,
            fail_open: true,
            max_attempts: 2,
            block_on_insufficient_evidence: false,
            endpoint: None,
            model: None,
            temperature: 0.0,
        }
    }
}

/// [tools] 段：单次工具调用超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// [llm] 段：恢复 / 总结 / 评审的模型调用超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
        }
    }
}

/// [fault_injection] 段：压测用的固定延迟与随机失败率，默认全部关闭
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FaultInjectionSection {
    pub latency_enabled: bool,
    pub latency_ms: u64,
    pub failure_rate: f64,
}

/// 从 config 目录加载配置，环境变量 FROG__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FROG__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigLoadError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FROG")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}

// ---------------------------------------------------------------------------
// 运行时覆盖（热加载）
// ---------------------------------------------------------------------------

/// 本地运行时覆盖：所有字段可选，只有「有效」的值（正数 / 非空）才会覆盖静态默认
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeOverrides {
    pub cache: Option<CacheOverrides>,
    pub execution: Option<ExecutionOverrides>,
    pub sub_agent: Option<SubAgentOverrides>,
    pub judge: Option<JudgeOverrides>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct CacheOverrides {
    pub version: Option<String>,
    pub search_ttl_seconds: Option<i64>,
    pub info_ttl_seconds: Option<i64>,
    pub dataset_ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ExecutionOverrides {
    pub max_tool_calls: Option<i64>,
    pub max_tool_calls_per_sub_agent: Option<i64>,
    pub max_retries_per_todo: Option<i64>,
    pub fail_fast: Option<bool>,
    pub default_execution_mode: Option<String>,
    pub max_total_recovery_retries: Option<i64>,
    pub max_static_recovery_retries: Option<i64>,
    pub max_runtime_recovery_retries: Option<i64>,
    pub max_semantic_recovery_retries: Option<i64>,
    pub static_precheck_enabled: Option<bool>,
    pub static_fix_endpoint: Option<String>,
    pub static_fix_model: Option<String>,
    pub static_fix_temperature: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SubAgentOverrides {
    pub enabled: Option<bool>,
    pub max_steps: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct JudgeOverrides {
    pub semantic_enabled: Option<bool>,
}

/// 可热加载的本地配置：持有当前快照，`current()` 返回不可变 Arc，调用方每次调用时重新读取
#[derive(Debug, Default)]
pub struct LocalConfigLoader {
    path: Option<PathBuf>,
    current: RwLock<Option<Arc<RuntimeOverrides>>>,
}

impl LocalConfigLoader {
    /// 绑定一个 TOML 文件（不会立即读取，需调用 reload）
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            current: RwLock::new(None),
        }
    }

    /// 不绑定文件，仅通过 `set` 注入（测试与嵌入场景）
    pub fn in_memory(overrides: Option<RuntimeOverrides>) -> Self {
        Self {
            path: None,
            current: RwLock::new(overrides.map(Arc::new)),
        }
    }

    pub fn current(&self) -> Option<Arc<RuntimeOverrides>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    pub fn set(&self, overrides: Option<RuntimeOverrides>) {
        if let Ok(mut guard) = self.current.write() {
            *guard = overrides.map(Arc::new);
        }
    }

    /// 从磁盘重新读取；文件不存在时清空覆盖。返回是否存在有效覆盖
    pub fn reload(&self) -> Result<bool, ConfigLoadError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(self.current().is_some());
        };
        if !path.exists() {
            self.set(None);
            return Ok(false);
        }
        let text = std::fs::read_to_string(path)?;
        let overrides: RuntimeOverrides = toml::from_str(&text)?;
        tracing::info!(path = %path.display(), "local runtime config reloaded");
        self.set(Some(overrides));
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// 合并后的快照（纯函数）
// ---------------------------------------------------------------------------

/// TTL 上限：一年
pub const MAX_CACHE_TTL_SECONDS: i64 = 365 * 24 * 3600;

/// 缓存 TTL 与版本（合并后）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTtlConfig {
    pub version: String,
    pub search_ttl_seconds: i64,
    pub info_ttl_seconds: i64,
    pub dataset_ttl_seconds: i64,
}

impl CacheTtlConfig {
    pub fn resolve(section: &CacheSection, local: Option<&RuntimeOverrides>) -> Self {
        let local = local.and_then(|o| o.cache.as_ref());
        let version = local
            .and_then(|c| c.version.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| Some(section.version.trim()).filter(|v| !v.is_empty()))
            .unwrap_or("v1")
            .to_string();
        Self {
            version,
            search_ttl_seconds: first_positive(
                local.and_then(|c| c.search_ttl_seconds),
                section.search_ttl_seconds,
            )
            .clamp(0, MAX_CACHE_TTL_SECONDS),
            info_ttl_seconds: first_positive(
                local.and_then(|c| c.info_ttl_seconds),
                section.info_ttl_seconds,
            )
            .clamp(0, MAX_CACHE_TTL_SECONDS),
            dataset_ttl_seconds: first_positive(
                local.and_then(|c| c.dataset_ttl_seconds),
                section.dataset_ttl_seconds,
            )
            .clamp(0, MAX_CACHE_TTL_SECONDS),
        }
    }
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self::resolve(&CacheSection::default(), None)
    }
}

/// 工作流执行配置（合并后）
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    pub max_tool_calls: u32,
    pub max_tool_calls_per_sub_agent: u32,
    pub max_retries_per_todo: u32,
    pub fail_fast: bool,
    pub default_execution_mode: ExecutionMode,
    pub sub_agent_enabled: bool,
    pub sub_agent_max_steps: u32,
    pub static_precheck_enabled: bool,
    pub semantic_judge_enabled: bool,
    pub max_static_recovery_retries: u32,
    pub max_runtime_recovery_retries: u32,
    pub max_semantic_recovery_retries: u32,
    pub max_total_recovery_retries: u32,
    pub static_fix_endpoint: String,
    pub static_fix_model: String,
    pub static_fix_temperature: Option<f64>,
}

impl WorkflowConfig {
    pub fn resolve(
        section: &WorkflowSection,
        judge: &JudgeSection,
        local: Option<&RuntimeOverrides>,
    ) -> Self {
        let exec = local.and_then(|o| o.execution.as_ref());
        let sub = local.and_then(|o| o.sub_agent.as_ref());
        let judge_local = local.and_then(|o| o.judge.as_ref());

        let max_tool_calls = clamp(
            first_positive(exec.and_then(|e| e.max_tool_calls), section.max_tool_calls),
            1,
            200,
        );
        let max_per_sub_agent = clamp(
            first_positive(
                exec.and_then(|e| e.max_tool_calls_per_sub_agent),
                section.max_tool_calls_per_sub_agent,
            ),
            1,
            100,
        );
        let fail_fast = exec.and_then(|e| e.fail_fast).unwrap_or(section.fail_fast);
        let mode_text = exec
            .and_then(|e| e.default_execution_mode.as_deref())
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&section.default_execution_mode);
        let sub_agent_enabled = sub.and_then(|s| s.enabled).unwrap_or(section.sub_agent_enabled);
        let sub_agent_max_steps = clamp(
            first_positive(sub.and_then(|s| s.max_steps), section.sub_agent_max_steps),
            1,
            20,
        );

        let max_retries_per_todo = clamp(
            first_positive(
                exec.and_then(|e| e.max_retries_per_todo),
                section.max_retries_per_todo,
            ),
            1,
            10,
        );
        let derived_total = (max_retries_per_todo - 1).max(0);
        let max_total = clamp(
            first_non_negative(
                exec.and_then(|e| e.max_total_recovery_retries),
                section.max_total_recovery_retries.unwrap_or(derived_total),
            ),
            0,
            20,
        );
        let per_category = |local: Option<i64>, fallback: Option<i64>| {
            clamp(first_non_negative(local, fallback.unwrap_or(max_total)), 0, 20)
        };

        let static_fix_endpoint = exec
            .and_then(|e| e.static_fix_endpoint.clone())
            .or_else(|| section.static_fix_endpoint.clone())
            .unwrap_or_default()
            .trim()
            .to_string();
        let static_fix_model = exec
            .and_then(|e| e.static_fix_model.clone())
            .or_else(|| section.static_fix_model.clone())
            .unwrap_or_default()
            .trim()
            .to_string();

        Self {
            max_tool_calls: max_tool_calls as u32,
            max_tool_calls_per_sub_agent: max_per_sub_agent as u32,
            max_retries_per_todo: max_retries_per_todo as u32,
            fail_fast,
            default_execution_mode: ExecutionMode::parse(mode_text),
            sub_agent_enabled,
            sub_agent_max_steps: sub_agent_max_steps as u32,
            static_precheck_enabled: exec
                .and_then(|e| e.static_precheck_enabled)
                .unwrap_or(section.static_precheck_enabled),
            semantic_judge_enabled: judge_local
                .and_then(|j| j.semantic_enabled)
                .unwrap_or(judge.semantic_enabled),
            max_static_recovery_retries: per_category(
                exec.and_then(|e| e.max_static_recovery_retries),
                section.max_static_recovery_retries,
            ) as u32,
            max_runtime_recovery_retries: per_category(
                exec.and_then(|e| e.max_runtime_recovery_retries),
                section.max_runtime_recovery_retries,
            ) as u32,
            max_semantic_recovery_retries: per_category(
                exec.and_then(|e| e.max_semantic_recovery_retries),
                section.max_semantic_recovery_retries,
            ) as u32,
            max_total_recovery_retries: max_total as u32,
            static_fix_endpoint,
            static_fix_model,
            static_fix_temperature: exec
                .and_then(|e| e.static_fix_temperature)
                .or(section.static_fix_temperature),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self::resolve(&WorkflowSection::default(), &JudgeSection::default(), None)
    }
}

fn first_positive(value: Option<i64>, fallback: i64) -> i64 {
    match value {
        Some(v) if v > 0 => v,
        _ => fallback,
    }
}

fn first_non_negative(value: Option<i64>, fallback: i64) -> i64 {
    match value {
        Some(v) if v >= 0 => v,
        _ => fallback,
    }
}

fn clamp(value: i64, min: i64, max: i64) -> i64 {
    value.max(min).min(max)
}
