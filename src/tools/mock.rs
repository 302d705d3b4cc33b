//! 内存版工具后端（用于测试与本地演示，无需行情服务和沙箱）
//!
//! `StaticMarketData` 对任意参数返回固定形状的成功信封并记录调用；
//! `StaticSandbox` 按脚本顺序返回预置结果，用尽后返回默认成功输出。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::backend::{CodeSandbox, MarketDataTools};
use super::envelope;
use super::registry::PythonArgs;
use crate::core::ToolError;

#[derive(Debug, Default)]
pub struct StaticMarketData {
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl StaticMarketData {
    /// 已收到的调用，形如 `getStockInfo:600000.SH`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// 之后的调用都返回传输层错误
    pub fn fail_with(&self, message: impl Into<String>) {
        if let Ok(mut f) = self.failure.lock() {
            *f = Some(message.into());
        }
    }

    pub fn delay(&self, delay: Duration) {
        if let Ok(mut d) = self.delay.lock() {
            *d = Some(delay);
        }
    }

    async fn respond(&self, tool: &str, arg: &str, data: serde_json::Value) -> Result<String, ToolError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{tool}:{arg}"));
        }
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failure.lock().ok().and_then(|f| f.clone());
        match failure {
            Some(message) => Err(ToolError::Backend(message)),
            None => Ok(envelope::success(tool, data)),
        }
    }

    fn search_data(keyword: &str) -> serde_json::Value {
        json!({ "keyword": keyword, "items": [{ "ts_code": "600000.SH", "name": keyword }] })
    }

    fn daily_data(ts_code: &str, start: &str, end: &str) -> serde_json::Value {
        json!({
            "dataset_id": format!("{ts_code}_{start}_{end}"),
            "rows": 20,
            "source": "fresh",
        })
    }
}

#[async_trait]
impl MarketDataTools for StaticMarketData {
    async fn get_stock_info(&self, ts_code: &str) -> Result<String, ToolError> {
        self.respond("getStockInfo", ts_code, json!({ "ts_code": ts_code, "name": "stock" }))
            .await
    }

    async fn get_stock_daily(
        &self,
        ts_code: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<String, ToolError> {
        self.respond(
            "getStockDaily",
            ts_code,
            Self::daily_data(ts_code, start_date, end_date),
        )
        .await
    }

    async fn search_stock(&self, keyword: &str) -> Result<String, ToolError> {
        self.respond("searchStock", keyword, Self::search_data(keyword))
            .await
    }

    async fn search_fund(&self, keyword: &str) -> Result<String, ToolError> {
        self.respond("searchFund", keyword, Self::search_data(keyword))
            .await
    }

    async fn get_index_info(&self, ts_code: &str) -> Result<String, ToolError> {
        self.respond("getIndexInfo", ts_code, json!({ "ts_code": ts_code, "name": "index" }))
            .await
    }

    async fn get_index_daily(
        &self,
        ts_code: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<String, ToolError> {
        self.respond(
            "getIndexDaily",
            ts_code,
            Self::daily_data(ts_code, start_date, end_date),
        )
        .await
    }

    async fn search_index(&self, keyword: &str) -> Result<String, ToolError> {
        self.respond("searchIndex", keyword, Self::search_data(keyword))
            .await
    }
}

/// 脚本化沙箱
#[derive(Debug, Default)]
pub struct StaticSandbox {
    script: Mutex<VecDeque<Result<String, ToolError>>>,
    calls: Mutex<Vec<PythonArgs>>,
}

impl StaticSandbox {
    /// 追加一次运行成功（stdout 为给定文本）
    pub fn push_success(&self, stdout: impl Into<String>) {
        let output = envelope::success("executePython", json!({ "stdout": stdout.into(), "exit_code": 0 }));
        self.push(Ok(output));
    }

    /// 追加一次运行失败（代码报错，信封 ok=false）
    pub fn push_failure(&self, stderr: impl Into<String>) {
        let output = envelope::failure(
            "executePython",
            "PYTHON_EXECUTION_ERROR",
            "Python execution failed",
            json!({ "stderr": stderr.into(), "exit_code": 1 }),
        );
        self.push(Ok(output));
    }

    /// 追加一次传输层错误
    pub fn push_error(&self, error: ToolError) {
        self.push(Err(error));
    }

    fn push(&self, item: Result<String, ToolError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
    }

    pub fn calls(&self) -> Vec<PythonArgs> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CodeSandbox for StaticSandbox {
    async fn execute_python(&self, args: &PythonArgs) -> Result<String, ToolError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(args.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(item) => item,
            None => Ok(envelope::success(
                "executePython",
                json!({ "stdout": "ok", "exit_code": 0 }),
            )),
        }
    }
}
