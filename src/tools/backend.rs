//! 工具后端抽象：行情数据服务与 Python 沙箱
//!
//! 后端返回统一信封格式的 JSON 文本（见 `envelope`）；传输层错误以 `ToolError` 返回，由路由转为失败信封。

use async_trait::async_trait;

use super::registry::PythonArgs;
use crate::core::ToolError;

/// 行情数据服务（股票 / 基金 / 指数）
#[async_trait]
pub trait MarketDataTools: Send + Sync {
    async fn get_stock_info(&self, ts_code: &str) -> Result<String, ToolError>;

    async fn get_stock_daily(
        &self,
        ts_code: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<String, ToolError>;

    async fn search_stock(&self, keyword: &str) -> Result<String, ToolError>;

    async fn search_fund(&self, keyword: &str) -> Result<String, ToolError>;

    async fn get_index_info(&self, ts_code: &str) -> Result<String, ToolError>;

    async fn get_index_daily(
        &self,
        ts_code: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<String, ToolError>;

    async fn search_index(&self, keyword: &str) -> Result<String, ToolError>;
}

/// Python 代码沙箱
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn execute_python(&self, args: &PythonArgs) -> Result<String, ToolError>;
}
