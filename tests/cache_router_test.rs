//! 缓存 key 归一、缓存命中、损坏条目自愈与恢复预算的集成测试

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use frog_agent::cache::{CacheMode, RemoteCache};
use frog_agent::config::AppConfig;
use frog_agent::core::{
    ExhaustedBy, FailureCategory, InvocationContext, RecoveryDecision, RecoveryPolicy, RetryBudget,
};
use frog_agent::tools::envelope;

const SCOPE: &str = "user:user-1";

fn ctx() -> InvocationContext {
    InvocationContext::new(RUN_ID, USER_ID)
}

#[test]
fn test_equivalent_params_share_cache_key() {
    let h = Harness::new(AppConfig::default());

    let a = h.cache.plan("getStockInfo", &params(json!({"ts_code": "600000.sh"})), SCOPE);
    let b = h.cache.plan("getStockInfo", &params(json!({"tsCode": " 600000.SH "})), SCOPE);
    assert_eq!(a.mode, CacheMode::Redis);
    assert_eq!(a.key, b.key);

    let c = h.cache.plan("searchFund", &params(json!({"keyword": "沪深  300"})), SCOPE);
    let d = h.cache.plan("searchFund", &params(json!({"query": "沪深 300"})), SCOPE);
    assert_eq!(c.key, d.key);

    // 2024-01-01 00:00 (UTC+8) 的毫秒时间戳
    let e = h.cache.plan(
        "getStockDaily",
        &params(json!({"ts_code": "600000.SH", "start_date": "1704038400000", "end_date": "2024-01-31"})),
        SCOPE,
    );
    let f = h.cache.plan(
        "getStockDaily",
        &params(json!({"tsCode": "600000.sh", "startDateStr": "20240101", "endDate": "20240131"})),
        SCOPE,
    );
    assert_eq!(e.mode, CacheMode::DatasetRegistry);
    assert_eq!(e.key, f.key);

    let other_user = h.cache.plan("getStockInfo", &params(json!({"ts_code": "600000.SH"})), "user:user-2");
    assert_ne!(a.key, other_user.key);
}

#[test]
fn test_code_execution_never_cached() {
    let h = Harness::new(AppConfig::default());
    let plan = h.cache.plan("executePython", &python_params(), SCOPE);
    assert_eq!(plan.mode, CacheMode::None);
    assert!(plan.key.is_empty());
}

#[tokio::test]
async fn test_warm_cache_skips_backend() {
    let h = Harness::new(AppConfig::default());
    let p = params(json!({"keyword": "浦发银行"}));

    let first = h.router.invoke_with_meta(Some(&ctx()), "searchStock", &p).await;
    let alias = params(json!({"query": "  浦发银行 "}));
    let second = h.router.invoke_with_meta(Some(&ctx()), "searchStock", &alias).await;

    assert!(first.success && second.success);
    assert_eq!(first.output, second.output);
    assert!(!first.cache_meta.as_ref().unwrap().hit);
    assert!(second.cache_meta.as_ref().unwrap().hit);
    assert_eq!(h.market.calls().len(), 1);
    assert_eq!(h.metrics.counter("cache.hit").get(), 1);
    assert_eq!(h.metrics.counter("cache.miss").get(), 1);
}

#[tokio::test]
async fn test_failed_call_not_cached() {
    let h = Harness::new(AppConfig::default());
    h.market.fail_with("boom");
    let p = params(json!({"ts_code": "600000.SH"}));

    let first = h.router.invoke_with_meta(Some(&ctx()), "getStockInfo", &p).await;
    assert!(!first.success);
    assert!(h.cache_store.is_empty().await);

    let second = h.router.invoke_with_meta(Some(&ctx()), "getStockInfo", &p).await;
    assert!(!second.success);
    assert_eq!(h.market.calls().len(), 2);
}

#[tokio::test]
async fn test_corrupt_entry_replaced_by_fresh_result() {
    let h = Harness::new(AppConfig::default());
    let p = params(json!({"keyword": "浦发银行"}));
    let key = h.cache.plan("searchStock", &p, SCOPE).key;
    h.cache_store
        .put_raw(&key, "{not valid json", Duration::from_secs(60))
        .await;

    let result = h.router.invoke_with_meta(Some(&ctx()), "searchStock", &p).await;

    assert!(result.success);
    assert!(!result.cache_meta.as_ref().unwrap().hit);
    assert_eq!(h.market.calls().len(), 1);
    let stored = h.cache_store.get(&key).await.unwrap().expect("entry rewritten");
    assert!(stored.contains("\"result\""));
    assert!(envelope::is_structured(&result.output));

    let again = h.router.invoke_with_meta(Some(&ctx()), "searchStock", &p).await;
    assert!(again.cache_meta.as_ref().unwrap().hit);
    assert_eq!(h.market.calls().len(), 1);
}

#[tokio::test]
async fn test_unknown_tool_returns_failure_envelope() {
    let h = Harness::new(AppConfig::default());
    let result = h
        .router
        .invoke_with_meta(Some(&ctx()), "deleteEverything", &params(json!({})))
        .await;
    assert!(!result.success);
    let parsed = envelope::parse_object(&result.output).unwrap();
    assert_eq!(parsed["error"]["code"], envelope::UNSUPPORTED_TOOL);
    assert!(h.market.calls().is_empty());
}

fn policy() -> RecoveryPolicy {
    RecoveryPolicy {
        max_retries_per_todo: 4,
        max_total_recovery_retries: 3,
        max_static_recovery_retries: 1,
        max_runtime_recovery_retries: 2,
        max_semantic_recovery_retries: 2,
    }
}

/// 按失败序列推进预算，返回每一步的决策
fn replay(sequence: &[FailureCategory]) -> Vec<RecoveryDecision> {
    let p = policy();
    let mut budget = RetryBudget::new();
    let mut decisions = Vec::new();
    for &category in sequence {
        budget.record_failure();
        let decision = p.decide(&budget, category);
        if decision == RecoveryDecision::Retry {
            budget.consume(category);
        }
        decisions.push(decision);
    }
    decisions
}

#[test]
fn test_recovery_decisions_follow_failure_sequence() {
    use FailureCategory::*;

    assert_eq!(
        replay(&[Static, Static]),
        vec![
            RecoveryDecision::Retry,
            RecoveryDecision::Exhausted(ExhaustedBy::Category(Static)),
        ]
    );
    assert_eq!(
        replay(&[Runtime, Semantic, Runtime, Semantic]),
        vec![
            RecoveryDecision::Retry,
            RecoveryDecision::Retry,
            RecoveryDecision::Retry,
            RecoveryDecision::Exhausted(ExhaustedBy::Total),
        ]
    );
    assert_eq!(
        replay(&[Runtime, Runtime, Runtime]),
        vec![
            RecoveryDecision::Retry,
            RecoveryDecision::Retry,
            RecoveryDecision::Exhausted(ExhaustedBy::Category(Runtime)),
        ]
    );
}

#[test]
fn test_recovery_decisions_are_deterministic() {
    use FailureCategory::*;
    let sequence = [Semantic, Static, Runtime, Semantic, Runtime];
    assert_eq!(replay(&sequence), replay(&sequence));
}
