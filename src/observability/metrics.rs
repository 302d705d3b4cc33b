//! 进程内指标：计数器与计时器
//!
//! 按名称惰性创建并复用（带 tag 的计时器以 `name{key=value}` 作为键）；底层为原子计数，可跨 run 并发更新。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Timer {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Timer {
    pub fn record_ms(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn record(&self, elapsed: Duration) {
        self.record_ms(elapsed.as_millis() as u64);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let count = self.count();
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        TimerSnapshot {
            count,
            total_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
            avg_ms: if count > 0 { total_ms / count } else { 0 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub timers: HashMap<String, TimerSnapshot>,
}

/// 指标注册表（共享，可变安全）
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<HashMap<String, Arc<Counter>>>,
    timers: Mutex<HashMap<String, Arc<Timer>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        match self.counters.lock() {
            Ok(mut map) => Arc::clone(map.entry(name.to_string()).or_default()),
            // 锁中毒时返回游离计数器，指标丢失但不影响调用方
            Err(_) => Arc::new(Counter::default()),
        }
    }

    pub fn timer(&self, name: &str) -> Arc<Timer> {
        match self.timers.lock() {
            Ok(mut map) => Arc::clone(map.entry(name.to_string()).or_default()),
            Err(_) => Arc::new(Timer::default()),
        }
    }

    pub fn tagged_timer(&self, name: &str, tag: &str, value: &str) -> Arc<Timer> {
        self.timer(&format!("{name}{{{tag}={value}}}"))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .lock()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.get())).collect())
            .unwrap_or_default();
        let timers = self
            .timers
            .lock()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.snapshot())).collect())
            .unwrap_or_default();
        MetricsSnapshot { counters, timers }
    }
}
