//! 缓存计划解析：工具名 + 参数 + 作用域 → (模式, key, TTL)
//!
//! 模式映射固定不可配置：检索 / 基础信息类 → Redis；区间行情类 → 数据集登记；其它（含代码执行）→ 不缓存。
//! key = `agent:tool-cache:<tool>:<sha256(归一化参数)>:<scope>:<version>`，
//! 同一逻辑参数（别名、代码大小写、等价日期写法不同）总是得到同一个 key。

use std::collections::BTreeMap;

use chrono::{FixedOffset, TimeZone};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::CacheTtlConfig;
use crate::tools::registry::{
    first_non_blank, value_text, ToolClass, ToolName, ANY_CODE_ALIASES, END_DATE_ALIASES,
    KEYWORD_ALIASES, START_DATE_ALIASES,
};

pub const CACHE_PREFIX: &str = "agent:tool-cache:";

/// 上交所 / 深交所所在时区（UTC+8，无夏令时）
const MARKET_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// 缓存模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    None,
    Redis,
    DatasetRegistry,
}

/// 单次调用的缓存计划，不持久化，每次调用重新计算
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePlan {
    pub mode: CacheMode,
    pub key: String,
    pub ttl_seconds: i64,
}

impl CachePlan {
    pub fn none() -> Self {
        Self {
            mode: CacheMode::None,
            key: String::new(),
            ttl_seconds: 0,
        }
    }
}

/// 解析缓存模式
pub fn resolve_mode(tool_name: &str) -> CacheMode {
    match ToolName::parse(tool_name.trim()).map(|t| t.class()) {
        Some(ToolClass::Search) | Some(ToolClass::Info) => CacheMode::Redis,
        Some(ToolClass::Dataset) => CacheMode::DatasetRegistry,
        Some(ToolClass::Code) | None => CacheMode::None,
    }
}

/// 解析 TTL（秒）
pub fn resolve_ttl_seconds(mode: CacheMode, tool_name: &str, ttl: &CacheTtlConfig) -> i64 {
    let class = ToolName::parse(tool_name.trim()).map(|t| t.class());
    match mode {
        CacheMode::Redis if class == Some(ToolClass::Search) => ttl.search_ttl_seconds.max(0),
        CacheMode::Redis => ttl.info_ttl_seconds.max(0),
        CacheMode::DatasetRegistry => ttl.dataset_ttl_seconds.max(0),
        CacheMode::None => 0,
    }
}

/// 解析完整缓存计划
pub fn resolve_plan(
    tool_name: &str,
    params: &Map<String, Value>,
    scope: &str,
    ttl: &CacheTtlConfig,
) -> CachePlan {
    let mode = resolve_mode(tool_name);
    if mode == CacheMode::None {
        return CachePlan::none();
    }
    CachePlan {
        mode,
        key: build_cache_key(tool_name, params, scope, &ttl.version),
        ttl_seconds: resolve_ttl_seconds(mode, tool_name, ttl),
    }
}

/// 构造缓存 key
pub fn build_cache_key(
    tool_name: &str,
    params: &Map<String, Value>,
    scope: &str,
    version: &str,
) -> String {
    let normalized = normalize_args(tool_name, params);
    // BTreeMap<String, String> 序列化不会失败
    let args_json = serde_json::to_string(&normalized).unwrap_or_else(|_| "{}".to_string());
    let args_hash = sha256_hex(&args_json);
    let scope = if scope.trim().is_empty() {
        "global"
    } else {
        scope.trim()
    };
    let version = if version.trim().is_empty() {
        "v1"
    } else {
        version.trim()
    };
    format!(
        "{CACHE_PREFIX}{}:{}:{}:{}",
        safe_token(tool_name),
        args_hash,
        safe_token(scope),
        safe_token(version)
    )
}

/// 按工具归一化参数，生成有序 Map；空值不进入 Map
pub fn normalize_args(tool_name: &str, params: &Map<String, Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        if !key.trim().is_empty() && !value.is_empty() {
            out.insert(key.to_string(), value);
        }
    };
    match ToolName::parse(tool_name.trim()).map(|t| t.class()) {
        Some(ToolClass::Search) => {
            put(
                "keyword",
                normalize_keyword(&first_non_blank(params, KEYWORD_ALIASES).unwrap_or_default()),
            );
        }
        Some(ToolClass::Info) => {
            put(
                "tsCode",
                normalize_code(&first_non_blank(params, ANY_CODE_ALIASES).unwrap_or_default()),
            );
        }
        Some(ToolClass::Dataset) => {
            put(
                "tsCode",
                normalize_code(&first_non_blank(params, ANY_CODE_ALIASES).unwrap_or_default()),
            );
            put(
                "startDateStr",
                normalize_date(&first_non_blank(params, START_DATE_ALIASES).unwrap_or_default()),
            );
            put(
                "endDateStr",
                normalize_date(&first_non_blank(params, END_DATE_ALIASES).unwrap_or_default()),
            );
        }
        Some(ToolClass::Code) | None => {
            for (key, value) in params {
                put(&safe_token(key), value_text(value).unwrap_or_default());
            }
        }
    }
    out
}

/// 关键词：空白折叠为单个空格并转小写
pub fn normalize_keyword(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 代码：转大写
pub fn normalize_code(text: &str) -> String {
    text.trim().to_uppercase()
}

/// 日期：归一为 8 位 YYYYMMDD；13 位数字视为毫秒时间戳，按 UTC+8 换算
pub fn normalize_date(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 13 {
        return epoch_millis_to_date(&digits).unwrap_or(digits);
    }
    if digits.len() >= 8 {
        return digits[..8].to_string();
    }
    text.to_string()
}

fn epoch_millis_to_date(digits: &str) -> Option<String> {
    let millis: i64 = digits.parse().ok()?;
    let offset = FixedOffset::east_opt(MARKET_UTC_OFFSET_SECS)?;
    let dt = offset.timestamp_millis_opt(millis).single()?;
    Some(dt.format("%Y%m%d").to_string())
}

/// 将 token 限制在 [a-zA-Z0-9:_-]，空白 token 变为 unknown
pub fn safe_token(raw: &str) -> String {
    if raw.trim().is_empty() {
        return "unknown".to_string();
    }
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
