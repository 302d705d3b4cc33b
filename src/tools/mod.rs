//! 工具层：统一信封、工具表与参数别名、后端抽象、路由
//!
//! 工具集合固定为行情查询（股票 / 基金 / 指数）与 Python 沙箱执行。

pub mod backend;
pub mod envelope;
pub mod mock;
pub mod registry;
pub mod router;

pub use backend::{CodeSandbox, MarketDataTools};
pub use mock::{StaticMarketData, StaticSandbox};
pub use registry::{PythonArgs, ToolArgs, ToolClass, ToolName};
pub use router::{ToolInvocationResult, ToolRouter};
