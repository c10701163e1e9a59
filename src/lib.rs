//! Valet - 个人自然语言助手的弹性编排层
//!
//! 模块划分：
//! - **capability**: 意图处理器（邮件、任务、SQL 查询、联网检索、日程、知识问答）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 弹性基建（错误分类、重试、限流、资源池、缓存、定时调度、优雅关闭）
//! - **intent**: 两段式意图路由（规则快匹配 + 模型兜底）
//! - **observability**: tracing 订阅器初始化
//! - **orchestrator**: 总装配与请求处理门面
//! - **providers**: 外部协作者（文本模型、邮件、关系存储、检索、知识索引）

pub mod capability;
pub mod config;
pub mod core;
pub mod intent;
pub mod observability;
pub mod orchestrator;
pub mod providers;

pub use config::{load_config, AppConfig};
pub use core::AssistantError;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
