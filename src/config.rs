//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `VALET__*` 覆盖（双下划线表示
//! 嵌套，如 `VALET__STORE__POOL_MAX_SIZE=4`）。所有字段都有默认值，
//! 没有配置文件也能以内置默认启动。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::rate_limit::Budget;
use crate::core::pool::PoolConfig;
use crate::core::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub store: StoreSection,
    pub mail: MailSection,
    pub llm: LlmSection,
    pub search: SearchSection,
    pub knowledge: KnowledgeSection,
    pub retry: RetrySection,
    pub limits: LimitsSection,
    pub schedule: ScheduleSection,
}

/// [app] 段：用户标识、回复格式化开关、单请求总超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 单用户系统的固定用户标识
    pub user_id: String,
    /// 是否让模型把回复格式化为 Markdown（额外一次模型调用）
    pub structure_replies: bool,
    /// 单个请求的总超时（秒），含重试在内
    pub request_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            user_id: "default".to_string(),
            structure_replies: false,
            request_timeout_secs: 60,
        }
    }
}

/// [store] 段：SQLite 路径与连接池边界
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
    pub pool_min_idle: usize,
    pub pool_max_size: usize,
    pub acquire_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("valet.db"),
            pool_min_idle: 1,
            pool_max_size: 10,
            acquire_timeout_secs: 5,
        }
    }
}

impl StoreSection {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_idle: self.pool_min_idle,
            max_size: self.pool_max_size,
            acquire_timeout: std::time::Duration::from_secs(self.acquire_timeout_secs),
        }
    }
}

/// [mail] 段：会话池边界、收件缓存 TTL、默认地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailSection {
    /// 每次抓取的最近邮件数
    pub recent_limit: usize,
    /// 收件箱摘要缓存 TTL（秒）
    pub cache_ttl_secs: u64,
    /// 用户自己的地址，日报收件人与未指定收件人时的兜底
    pub self_address: String,
    pub pool_min_idle: usize,
    pub pool_max_size: usize,
    pub acquire_timeout_secs: u64,
}

impl Default for MailSection {
    fn default() -> Self {
        Self {
            recent_limit: 5,
            cache_ttl_secs: 300,
            self_address: "user@example.com".to_string(),
            pool_min_idle: 1,
            pool_max_size: 2,
            acquire_timeout_secs: 5,
        }
    }
}

impl MailSection {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_idle: self.pool_min_idle,
            max_size: self.pool_max_size,
            acquire_timeout: std::time::Duration::from_secs(self.acquire_timeout_secs),
        }
    }
}

/// [llm] 段：后端选择、模型与采样参数
///
/// API Key 从环境变量 OPENAI_API_KEY 读取；缺失时自动退回 mock 后端。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.1,
            request_timeout_secs: 30,
        }
    }
}

/// [search] 段：联网检索端点；endpoint 为空时用离线 mock
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub endpoint: Option<String>,
    pub max_results: usize,
    pub timeout_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_results: 5,
            timeout_secs: 10,
        }
    }
}

/// [knowledge] 段：本地知识库语料与索引缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeSection {
    /// 语料目录（.txt/.md）；不存在时用内置语料
    pub corpus_dir: PathBuf,
    /// 索引工件缓存目录
    pub cache_dir: PathBuf,
    pub chunk_chars: usize,
    pub overlap_chars: usize,
    pub top_k: usize,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::from("knowledge"),
            cache_dir: PathBuf::from(".valet/index"),
            chunk_chars: 800,
            overlap_chars: 80,
            top_k: 3,
        }
    }
}

/// [retry] 段：指数退避参数；max_retries 为总尝试次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySection {
    pub fn as_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.initial_delay_ms, self.backoff_multiplier)
    }
}

/// [limits] 段：各能力的滑动窗口预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    #[serde(default = "default_llm_budget")]
    pub llm: BudgetSection,
    #[serde(default = "default_mail_send_budget")]
    pub mail_send: BudgetSection,
    #[serde(default = "default_search_budget")]
    pub search: BudgetSection,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            llm: default_llm_budget(),
            mail_send: default_mail_send_budget(),
            search: default_search_budget(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub max_calls: usize,
    pub window_secs: u64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        default_llm_budget()
    }
}

impl BudgetSection {
    pub fn as_budget(&self) -> Budget {
        Budget::new(self.max_calls, self.window_secs)
    }
}

fn default_llm_budget() -> BudgetSection {
    BudgetSection {
        max_calls: 10,
        window_secs: 60,
    }
}

fn default_mail_send_budget() -> BudgetSection {
    BudgetSection {
        max_calls: 5,
        window_secs: 60,
    }
}

// 检索配额按天计
fn default_search_budget() -> BudgetSection {
    BudgetSection {
        max_calls: 25,
        window_secs: 86_400,
    }
}

/// [schedule] 段：每日任务时刻
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    /// 日报触发时刻，"HH:MM" 或 "H:MM AM/PM"
    pub daily_summary: String,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            daily_summary: "06:00".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 VALET__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 VALET__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("VALET")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
