//! 进程内的状态存储与运行控制（单机部署与测试使用）

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::WorkflowError;
use crate::workflow::collaborators::{RunControl, WorkflowStateStore};
use crate::workflow::types::WorkflowState;

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<String, WorkflowState>>,
    counts: RwLock<HashMap<String, u32>>,
    saves: AtomicUsize,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累计保存次数
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self, run_id: &str) -> Option<WorkflowState> {
        self.states.read().await.get(run_id).cloned()
    }
}

#[async_trait]
impl WorkflowStateStore for InMemoryStateStore {
    async fn save_workflow_state(&self, run_id: &str, state: &WorkflowState) -> Result<(), WorkflowError> {
        self.states
            .write()
            .await
            .insert(run_id.to_string(), state.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load_workflow_state(&self, run_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        Ok(self.states.read().await.get(run_id).cloned())
    }

    async fn clear_workflow_state(&self, run_id: &str) -> Result<(), WorkflowError> {
        self.states.write().await.remove(run_id);
        Ok(())
    }

    async fn tool_call_count(&self, run_id: &str) -> Result<u32, WorkflowError> {
        Ok(self.counts.read().await.get(run_id).copied().unwrap_or(0))
    }

    async fn increment_tool_call_count(&self, run_id: &str, n: u32) -> Result<u32, WorkflowError> {
        let mut counts = self.counts.write().await;
        let entry = counts.entry(run_id.to_string()).or_insert(0);
        *entry = entry.saturating_add(n);
        Ok(*entry)
    }

    async fn set_tool_call_count(&self, run_id: &str, count: u32) -> Result<(), WorkflowError> {
        self.counts.write().await.insert(run_id.to_string(), count);
        Ok(())
    }
}

/// 开关式运行控制
#[derive(Debug)]
pub struct StaticRunControl {
    runnable: AtomicBool,
}

impl StaticRunControl {
    pub fn new(runnable: bool) -> Self {
        Self {
            runnable: AtomicBool::new(runnable),
        }
    }

    pub fn set_runnable(&self, runnable: bool) {
        self.runnable.store(runnable, Ordering::SeqCst);
    }
}

impl Default for StaticRunControl {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl RunControl for StaticRunControl {
    async fn is_runnable(&self, _run_id: &str, _user_id: &str) -> bool {
        self.runnable.load(Ordering::SeqCst)
    }
}

/// 前 n 次检查放行，之后一律返回不可运行（模拟运行中途被暂停）
#[derive(Debug)]
pub struct CountdownRunControl {
    remaining: AtomicUsize,
}

impl CountdownRunControl {
    pub fn allow(checks: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(checks),
        }
    }
}

#[async_trait]
impl RunControl for CountdownRunControl {
    async fn is_runnable(&self, _run_id: &str, _user_id: &str) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tool_call_counter() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.tool_call_count("r").await.unwrap(), 0);
        assert_eq!(store.increment_tool_call_count("r", 2).await.unwrap(), 2);
        store.set_tool_call_count("r", 7).await.unwrap();
        assert_eq!(store.increment_tool_call_count("r", 1).await.unwrap(), 8);
        assert_eq!(store.tool_call_count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_state_roundtrip_and_clear() {
        let store = InMemoryStateStore::new();
        let state = WorkflowState {
            current_index: 2,
            tool_calls_used: 3,
            ..Default::default()
        };
        store.save_workflow_state("r", &state).await.unwrap();
        assert_eq!(store.load_workflow_state("r").await.unwrap(), Some(state));
        store.clear_workflow_state("r").await.unwrap();
        assert!(store.load_workflow_state("r").await.unwrap().is_none());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_countdown_run_control() {
        let control = CountdownRunControl::allow(2);
        assert!(control.is_runnable("r", "u").await);
        assert!(control.is_runnable("r", "u").await);
        assert!(!control.is_runnable("r", "u").await);
        assert!(!control.is_runnable("r", "u").await);
    }
}
