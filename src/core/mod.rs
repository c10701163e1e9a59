//! 核心弹性层：错误分类、重试、限流、资源池、缓存、定时调度与优雅关闭

pub mod cache;
pub mod error;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod shutdown;

pub use cache::{fingerprint, ArtifactCache, TtlCache};
pub use error::AssistantError;
pub use pool::{HandleFactory, PoolConfig, PooledHandle, ResourcePool};
pub use rate_limit::{Budget, RateLimiter};
pub use retry::RetryPolicy;
pub use scheduler::{DailyScheduler, JobHandler};
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
