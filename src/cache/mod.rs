//! 工具结果缓存：缓存计划、远程存储抽象、缓存服务

pub mod plan;
pub mod service;
pub mod store;

pub use plan::{build_cache_key, resolve_plan, CacheMode, CachePlan};
pub use service::{
    is_dataset_reuse, CacheMeta, CachePayload, CachedToolCallResult, ToolExecutionOutcome,
    ToolLoader, ToolResultCache,
};
pub use store::{InMemoryCache, RemoteCache};
