//! 工具结果缓存：按缓存计划命中 / 回源 / 回写
//!
//! - Redis 模式：读取并校验结构化信封，命中则不调用 loader；回源成功且结构合法才回写
//! - 数据集登记模式：不回写，命中与否由工具返回的 payload 推断（`is_dataset_reuse`）
//! - 任何存储或序列化错误都降级为「不走缓存」，只打 warn 日志

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::plan::{resolve_plan, CacheMode, CachePlan};
use super::store::RemoteCache;
use crate::config::{CacheSection, CacheTtlConfig, LocalConfigLoader};
use crate::core::ToolError;
use crate::observability::MetricsRegistry;
use crate::tools::envelope;

pub const SOURCE_REDIS: &str = "redis_tool_cache";
pub const SOURCE_DATASET_REGISTRY: &str = "dataset_registry";
pub const SOURCE_NONE: &str = "none";

/// 缓存元信息（随工具调用事件上报）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub eligible: bool,
    pub hit: bool,
    pub key: String,
    pub ttl_remaining_ms: i64,
    pub source: String,
    pub estimated_saved_duration_ms: u64,
}

impl Default for CacheMeta {
    fn default() -> Self {
        Self {
            eligible: false,
            hit: false,
            key: String::new(),
            ttl_remaining_ms: -1,
            source: SOURCE_NONE.to_string(),
            estimated_saved_duration_ms: 0,
        }
    }
}

impl CacheMeta {
    /// 事件 payload；None 与默认值渲染一致
    pub fn to_payload(&self) -> Value {
        json!({
            "eligible": self.eligible,
            "hit": self.hit,
            "key": self.key,
            "ttlRemainingMs": self.ttl_remaining_ms,
            "source": self.source,
            "estimatedSavedDurationMs": self.estimated_saved_duration_ms,
        })
    }

    pub fn payload_of(meta: Option<&CacheMeta>) -> Value {
        match meta {
            Some(m) => m.to_payload(),
            None => CacheMeta::default().to_payload(),
        }
    }
}

/// loader 的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExecutionOutcome {
    pub result: String,
    pub duration_ms: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToolCallResult {
    pub result: String,
    pub duration_ms: u64,
    pub success: bool,
    pub cache_meta: CacheMeta,
}

/// 写入远程缓存的 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePayload {
    pub result: String,
    #[serde(default)]
    pub original_duration_ms: u64,
    #[serde(default)]
    pub cached_at_millis: i64,
}

pub type ToolLoader<'a> = BoxFuture<'a, Result<ToolExecutionOutcome, ToolError>>;

pub struct ToolResultCache {
    store: Arc<dyn RemoteCache>,
    section: CacheSection,
    local: Arc<LocalConfigLoader>,
    metrics: Arc<MetricsRegistry>,
}

impl ToolResultCache {
    pub fn new(
        store: Arc<dyn RemoteCache>,
        section: CacheSection,
        local: Arc<LocalConfigLoader>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            section,
            local,
            metrics,
        }
    }

    /// 当前生效的 TTL / 版本（每次调用重新读取本地覆盖）
    pub fn ttl_config(&self) -> CacheTtlConfig {
        let local = self.local.current();
        CacheTtlConfig::resolve(&self.section, local.as_deref())
    }

    pub fn plan(&self, tool_name: &str, params: &Map<String, Value>, scope: &str) -> CachePlan {
        resolve_plan(tool_name, params, scope, &self.ttl_config())
    }

    /// 缓存优先执行：命中时 loader 不会被调用；未命中时 loader 恰好调用一次
    pub async fn execute_with_cache<'a, F>(
        &self,
        tool_name: &str,
        params: &Map<String, Value>,
        scope: &str,
        loader: F,
    ) -> CachedToolCallResult
    where
        F: FnOnce() -> ToolLoader<'a>,
    {
        let plan = self.plan(tool_name, params, scope);
        tracing::debug!(
            tool = tool_name,
            mode = ?plan.mode,
            key = %plan.key,
            ttl_seconds = plan.ttl_seconds,
            scope,
            "cache plan resolved"
        );
        let lookup_started = Instant::now();

        if plan.mode == CacheMode::Redis && plan.ttl_seconds > 0 {
            if let Some(cached) = self.read_cache(&plan.key).await {
                let duration_ms = lookup_started.elapsed().as_millis() as u64;
                let ttl_remaining_ms = self.ttl_remaining_ms(&plan.key).await;
                let saved = cached.original_duration_ms.saturating_sub(duration_ms);
                self.metrics.counter("cache.hit").increment();
                self.metrics.timer("cache.lookup").record_ms(duration_ms);
                tracing::debug!(tool = tool_name, key = %plan.key, ttl_remaining_ms, saved_ms = saved, "cache hit");
                return CachedToolCallResult {
                    result: cached.result,
                    duration_ms,
                    success: true,
                    cache_meta: CacheMeta {
                        eligible: true,
                        hit: true,
                        key: plan.key,
                        ttl_remaining_ms,
                        source: SOURCE_REDIS.to_string(),
                        estimated_saved_duration_ms: saved,
                    },
                };
            }
        }

        self.metrics.counter("cache.miss").increment();
        let loaded = normalize_outcome(tool_name, loader().await);

        let ttl_ms = if plan.ttl_seconds > 0 {
            plan.ttl_seconds.saturating_mul(1000)
        } else {
            -1
        };
        let cache_meta = match plan.mode {
            CacheMode::None => CacheMeta::default(),
            CacheMode::Redis => {
                if loaded.success && plan.ttl_seconds > 0 && envelope::is_structured(&loaded.result)
                {
                    self.write_cache(&plan.key, &loaded.result, loaded.duration_ms, plan.ttl_seconds)
                        .await;
                }
                CacheMeta {
                    eligible: true,
                    hit: false,
                    key: plan.key.clone(),
                    ttl_remaining_ms: ttl_ms,
                    source: SOURCE_REDIS.to_string(),
                    estimated_saved_duration_ms: 0,
                }
            }
            CacheMode::DatasetRegistry => CacheMeta {
                eligible: true,
                hit: is_dataset_reuse(&loaded.result),
                key: plan.key.clone(),
                ttl_remaining_ms: ttl_ms,
                source: SOURCE_DATASET_REGISTRY.to_string(),
                estimated_saved_duration_ms: 0,
            },
        };

        CachedToolCallResult {
            result: loaded.result,
            duration_ms: loaded.duration_ms,
            success: loaded.success,
            cache_meta,
        }
    }

    /// 读取并校验缓存条目；损坏或非结构化条目会被删除并视为未命中
    async fn read_cache(&self, key: &str) -> Option<CachePayload> {
        if key.trim().is_empty() {
            return None;
        }
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) if !raw.trim().is_empty() => raw,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "read tool cache failed");
                return None;
            }
        };
        match serde_json::from_str::<CachePayload>(&raw) {
            Ok(payload) if envelope::is_structured(&payload.result) => Some(payload),
            Ok(_) => {
                tracing::info!(key, "ignore legacy tool cache payload");
                self.evict(key).await;
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "parse tool cache failed");
                self.evict(key).await;
                None
            }
        }
    }

    async fn evict(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            tracing::warn!(key, error = %e, "delete tool cache failed");
        }
    }

    async fn write_cache(&self, key: &str, result: &str, original_duration_ms: u64, ttl_seconds: i64) {
        if key.trim().is_empty() || result.trim().is_empty() || ttl_seconds <= 0 {
            return;
        }
        let payload = CachePayload {
            result: result.to_string(),
            original_duration_ms,
            cached_at_millis: chrono::Utc::now().timestamp_millis(),
        };
        let text = match serde_json::to_string(&payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(key, error = %e, "serialize tool cache failed");
                return;
            }
        };
        let ttl = Duration::from_secs(ttl_seconds as u64);
        if let Err(e) = self.store.set_with_ttl(key, &text, ttl).await {
            tracing::warn!(key, error = %e, "write tool cache failed");
        }
    }

    async fn ttl_remaining_ms(&self, key: &str) -> i64 {
        match self.store.ttl_remaining_ms(key).await {
            Ok(Some(ms)) => ms,
            Ok(None) => -1,
            Err(e) => {
                tracing::warn!(key, error = %e, "read tool cache ttl failed");
                -1
            }
        }
    }
}

/// loader 出错或返回空输出时合成失败信封
fn normalize_outcome(
    tool_name: &str,
    loaded: Result<ToolExecutionOutcome, ToolError>,
) -> ToolExecutionOutcome {
    match loaded {
        Ok(outcome) if !outcome.result.trim().is_empty() => outcome,
        Ok(outcome) => ToolExecutionOutcome {
            result: envelope::failure(
                tool_name,
                envelope::EMPTY_LOADER_RESULT,
                "Tool invocation error: empty loader result",
                json!({}),
            ),
            duration_ms: outcome.duration_ms,
            success: false,
        },
        Err(e) => ToolExecutionOutcome {
            result: envelope::failure(tool_name, e.code(), &e.to_string(), json!({})),
            duration_ms: 0,
            success: false,
        },
    }
}

/// 数据集登记命中判定：`data.cache_hit` 布尔优先，否则 `data.source == "reused"`（忽略大小写）
pub fn is_dataset_reuse(result: &str) -> bool {
    let Some(root) = envelope::parse_object(result) else {
        return false;
    };
    if root.get("ok").and_then(Value::as_bool) != Some(true) {
        return false;
    }
    let Some(data) = root.get("data").and_then(Value::as_object) else {
        return false;
    };
    if let Some(hit) = data.get("cache_hit").and_then(Value::as_bool) {
        return hit;
    }
    data.get("source")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("reused"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> (ToolResultCache, Arc<InMemoryCache>, Arc<MetricsRegistry>) {
        let store = Arc::new(InMemoryCache::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let cache = ToolResultCache::new(
            store.clone(),
            CacheSection::default(),
            Arc::new(LocalConfigLoader::in_memory(None)),
            metrics.clone(),
        );
        (cache, store, metrics)
    }

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn ok_outcome(tool: &str) -> ToolExecutionOutcome {
        ToolExecutionOutcome {
            result: envelope::success(tool, json!({"items": [{"ts_code": "600000.SH"}]})),
            duration_ms: 120,
            success: true,
        }
    }

    #[tokio::test]
    async fn test_redis_miss_then_hit() {
        let (cache, _, metrics) = service();
        let calls = AtomicUsize::new(0);
        let p = params(json!({"keyword": "bank"}));

        let first = cache
            .execute_with_cache("searchStock", &p, "global", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(ok_outcome("searchStock")) })
            })
            .await;
        assert!(first.success);
        assert!(first.cache_meta.eligible);
        assert!(!first.cache_meta.hit);
        assert_eq!(first.cache_meta.ttl_remaining_ms, 3_600_000);

        let second = cache
            .execute_with_cache("searchStock", &p, "global", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(ok_outcome("searchStock")) })
            })
            .await;
        assert!(second.cache_meta.hit);
        assert_eq!(second.cache_meta.source, SOURCE_REDIS);
        assert_eq!(second.result, first.result);
        assert!(second.cache_meta.ttl_remaining_ms > 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.counter("cache.hit").get(), 1);
        assert_eq!(metrics.counter("cache.miss").get(), 1);
        assert_eq!(metrics.timer("cache.lookup").count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_calls_leave_one_valid_entry() {
        const N: usize = 8;
        let (cache, store, metrics) = service();
        let p = params(json!({"keyword": "bank"}));
        let key = cache.plan("searchStock", &p, "global").key;
        let counters: Vec<AtomicUsize> = (0..N).map(|_| AtomicUsize::new(0)).collect();
        let outputs: Vec<String> = (0..N)
            .map(|i| envelope::success("searchStock", json!({"writer": i})))
            .collect();

        let calls = (0..N).map(|i| {
            let counter = &counters[i];
            let output = outputs[i].clone();
            cache.execute_with_cache("searchStock", &p, "global", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(ToolExecutionOutcome {
                        result: output,
                        duration_ms: 20,
                        success: true,
                    })
                })
            })
        });
        let results = futures_util::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.success && !r.cache_meta.hit));
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(metrics.counter("cache.miss").get(), N as u64);
        assert_eq!(store.stored_entries().await, 1);

        let raw = store.get(&key).await.unwrap().unwrap();
        let payload: CachePayload = serde_json::from_str(&raw).unwrap();
        assert!(envelope::is_structured(&payload.result));
        assert!(outputs.contains(&payload.result));
        let ttl = store.ttl_remaining_ms(&key).await.unwrap().unwrap();
        assert!(ttl > 0 && ttl <= 3_600_000);

        let warm = cache
            .execute_with_cache("searchStock", &p, "global", || {
                Box::pin(async { Ok(ok_outcome("searchStock")) })
            })
            .await;
        assert!(warm.cache_meta.hit);
        assert_eq!(warm.result, payload.result);
    }

    #[tokio::test]
    async fn test_failed_result_not_written() {
        let (cache, store, _) = service();
        let p = params(json!({"tsCode": "600000.SH"}));
        let result = cache
            .execute_with_cache("getStockInfo", &p, "global", || {
                Box::pin(async {
                    Ok(ToolExecutionOutcome {
                        result: envelope::failure("getStockInfo", "TOOL_INVOCATION_ERROR", "boom", json!({})),
                        duration_ms: 5,
                        success: false,
                    })
                })
            })
            .await;
        assert!(!result.success);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unstructured_result_not_written() {
        let (cache, store, _) = service();
        let p = params(json!({"tsCode": "600000.SH"}));
        cache
            .execute_with_cache("getStockInfo", &p, "global", || {
                Box::pin(async {
                    Ok(ToolExecutionOutcome {
                        result: "plain text".into(),
                        duration_ms: 5,
                        success: true,
                    })
                })
            })
            .await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_entry_self_heals() {
        let (cache, store, _) = service();
        let p = params(json!({"keyword": "bank"}));
        let key = cache.plan("searchStock", &p, "global").key;
        store.put_raw(&key, "{broken", Duration::from_secs(60)).await;

        let calls = AtomicUsize::new(0);
        let result = cache
            .execute_with_cache("searchStock", &p, "global", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(ok_outcome("searchStock")) })
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!result.cache_meta.hit);
        let stored = store.get(&key).await.unwrap().unwrap();
        let payload: CachePayload = serde_json::from_str(&stored).unwrap();
        assert!(envelope::is_structured(&payload.result));
    }

    #[tokio::test]
    async fn test_legacy_payload_evicted() {
        let (cache, store, _) = service();
        let p = params(json!({"keyword": "bank"}));
        let key = cache.plan("searchStock", &p, "global").key;
        let legacy = serde_json::to_string(&CachePayload {
            result: "[1,2,3]".into(),
            original_duration_ms: 10,
            cached_at_millis: 0,
        })
        .unwrap();
        store.put_raw(&key, &legacy, Duration::from_secs(60)).await;
        let result = cache
            .execute_with_cache("searchStock", &p, "global", || {
                Box::pin(async {
                    Ok(ToolExecutionOutcome {
                        result: envelope::failure("searchStock", "TOOL_INVOCATION_ERROR", "down", json!({})),
                        duration_ms: 1,
                        success: false,
                    })
                })
            })
            .await;
        assert!(!result.cache_meta.hit);
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_loader_error_and_empty_output() {
        let (cache, _, _) = service();
        let p = Map::new();
        let failed = cache
            .execute_with_cache("executePython", &p, "global", || {
                Box::pin(async { Err(ToolError::Backend("sandbox down".into())) })
            })
            .await;
        assert!(!failed.success);
        let v: Value = serde_json::from_str(&failed.result).unwrap();
        assert_eq!(v["error"]["code"], "TOOL_INVOCATION_ERROR");
        assert_eq!(failed.cache_meta, CacheMeta::default());

        let empty = cache
            .execute_with_cache("executePython", &p, "global", || {
                Box::pin(async {
                    Ok(ToolExecutionOutcome {
                        result: "  ".into(),
                        duration_ms: 3,
                        success: true,
                    })
                })
            })
            .await;
        assert!(!empty.success);
        let v: Value = serde_json::from_str(&empty.result).unwrap();
        assert_eq!(v["error"]["code"], "EMPTY_LOADER_RESULT");
    }

    #[tokio::test]
    async fn test_dataset_mode_infers_hit_without_writing() {
        let (cache, store, _) = service();
        let p = params(json!({"tsCode": "600000.SH", "startDate": "20240101", "endDate": "20240131"}));
        let result = cache
            .execute_with_cache("getStockDaily", &p, "global", || {
                Box::pin(async {
                    Ok(ToolExecutionOutcome {
                        result: envelope::success(
                            "getStockDaily",
                            json!({"dataset_id": "ds_1", "source": "REUSED"}),
                        ),
                        duration_ms: 8,
                        success: true,
                    })
                })
            })
            .await;
        assert!(result.cache_meta.hit);
        assert_eq!(result.cache_meta.source, SOURCE_DATASET_REGISTRY);
        assert_eq!(result.cache_meta.ttl_remaining_ms, 604_800_000);
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_dataset_reuse_detection() {
        assert!(is_dataset_reuse(&envelope::success("t", json!({"cache_hit": true}))));
        assert!(!is_dataset_reuse(&envelope::success(
            "t",
            json!({"cache_hit": false, "source": "reused"})
        )));
        assert!(is_dataset_reuse(&envelope::success("t", json!({"source": "Reused"}))));
        assert!(!is_dataset_reuse(&envelope::success("t", json!({"source": "fresh"}))));
        assert!(!is_dataset_reuse(&envelope::failure("t", "X", "m", json!({}))));
        assert!(!is_dataset_reuse("not json"));
    }

    #[test]
    fn test_meta_payload_defaults() {
        let payload = CacheMeta::payload_of(None);
        assert_eq!(payload["eligible"], false);
        assert_eq!(payload["ttlRemainingMs"], -1);
        assert_eq!(payload["source"], "none");
        assert_eq!(payload["estimatedSavedDurationMs"], 0);
    }
}
