//! 工作流事件：类型、事件体与事件下游
//!
//! `EventSink::append` 是单向调用：同步、不返回错误、不阻塞执行器。
//! `ChannelEventSink` 使用有界通道，满了直接丢弃并打 warn；`RecordingEventSink` 供测试断言。

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowPaused,
    TodoStarted,
    TodoFinished,
    TodoFailed,
    TodoSkipped,
    TodoRetry,
    TodoRetryExhausted,
    TodoRecoveryStarted,
    TodoRecoveryCompleted,
    ToolCallStarted,
    ToolCallFinished,
    ToolCallLimitReached,
    ToolCallStaticPrecheckFailed,
    ToolCallPlaceholderUnresolved,
    SemanticJudgeRejected,
    SubAgentStarted,
    SubAgentFinished,
    FinalAnswerGenerating,
    FinalAnswerCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowPaused => "WORKFLOW_PAUSED",
            EventType::TodoStarted => "TODO_STARTED",
            EventType::TodoFinished => "TODO_FINISHED",
            EventType::TodoFailed => "TODO_FAILED",
            EventType::TodoSkipped => "TODO_SKIPPED",
            EventType::TodoRetry => "TODO_RETRY",
            EventType::TodoRetryExhausted => "TODO_RETRY_EXHAUSTED",
            EventType::TodoRecoveryStarted => "TODO_RECOVERY_STARTED",
            EventType::TodoRecoveryCompleted => "TODO_RECOVERY_COMPLETED",
            EventType::ToolCallStarted => "TOOL_CALL_STARTED",
            EventType::ToolCallFinished => "TOOL_CALL_FINISHED",
            EventType::ToolCallLimitReached => "TOOL_CALL_LIMIT_REACHED",
            EventType::ToolCallStaticPrecheckFailed => "TOOL_CALL_STATIC_PRECHECK_FAILED",
            EventType::ToolCallPlaceholderUnresolved => "TOOL_CALL_PLACEHOLDER_UNRESOLVED",
            EventType::SemanticJudgeRejected => "SEMANTIC_JUDGE_REJECTED",
            EventType::SubAgentStarted => "SUB_AGENT_STARTED",
            EventType::SubAgentFinished => "SUB_AGENT_FINISHED",
            EventType::FinalAnswerGenerating => "FINAL_ANSWER_GENERATING",
            EventType::FinalAnswerCompleted => "FINAL_ANSWER_COMPLETED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条工作流事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowEvent {
    pub run_id: String,
    pub user_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub created_at: i64,
}

impl WorkflowEvent {
    pub fn new(
        run_id: impl Into<String>,
        user_id: impl Into<String>,
        event_type: EventType,
        payload: Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            user_id: user_id.into(),
            event_type,
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 事件下游（外部协作方）
pub trait EventSink: Send + Sync {
    fn append(&self, event: WorkflowEvent);
}

/// 内存记录（测试与调试）
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<WorkflowEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.of_type(event_type).len()
    }
}

impl EventSink for RecordingEventSink {
    fn append(&self, event: WorkflowEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// 有界通道下游：消费者落后时丢弃事件而不是阻塞执行器
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn append(&self, event: WorkflowEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    run_id = %event.run_id,
                    event_type = %event.event_type,
                    "event channel full, event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!(
                    run_id = %event.run_id,
                    event_type = %event.event_type,
                    "event channel closed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingEventSink::new();
        sink.append(WorkflowEvent::new("r", "u", EventType::TodoStarted, json!({})));
        sink.append(WorkflowEvent::new("r", "u", EventType::TodoFinished, json!({"todo_id": "t1"})));
        assert_eq!(sink.types(), vec![EventType::TodoStarted, EventType::TodoFinished]);
        assert_eq!(sink.of_type(EventType::TodoFinished)[0].payload["todo_id"], "t1");
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelEventSink::new(1);
        sink.append(WorkflowEvent::new("r", "u", EventType::TodoStarted, json!({})));
        sink.append(WorkflowEvent::new("r", "u", EventType::TodoFinished, json!({})));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::TodoStarted);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_type_serializes_screaming() {
        assert_eq!(
            serde_json::to_value(EventType::ToolCallStaticPrecheckFailed).unwrap(),
            json!("TOOL_CALL_STATIC_PRECHECK_FAILED")
        );
    }
}
