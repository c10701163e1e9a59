//! 缓存：内存 TTL 缓存 + 磁盘工件缓存
//!
//! TtlCache 条目带过期时间，读取时惰性清除；ArtifactCache 把可重建的昂贵
//! 工件（如知识库索引）按指纹落盘成 JSON 文件，损坏的条目视为未命中。

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::core::AssistantError;

struct Entry<V> {
    value: V,
    expires_at: tokio::time::Instant,
}

/// 带 TTL 的内存缓存；过期条目在下次读取时清除
pub struct TtlCache<K, V> {
    default_ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 命中且未过期返回克隆值；过期条目当场移除并视为未命中
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if tokio::time::Instant::now() < entry.expires_at => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// 写入并以默认 TTL 重置过期时间；同键覆盖
    pub async fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl).await;
    }

    pub async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            Entry {
                value,
                expires_at: tokio::time::Instant::now() + ttl,
            },
        );
    }

    /// 主动失效；写路径完成后调用，让下一次读取看到新数据
    pub async fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
    }
}

/// 磁盘工件缓存：每个指纹一个 JSON 文件，读不出来就当未命中让调用方重建
#[derive(Debug)]
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// 按指纹加载工件；文件缺失、读取失败或 JSON 损坏都返回 None
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.entry_path(key);
        if !path.exists() {
            return None;
        }
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(key, error = %err, "artifact cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(value) => {
                tracing::debug!(key, "artifact cache hit");
                Some(value)
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "artifact cache entry corrupt, treating as miss");
                None
            }
        }
    }

    /// 写入工件；父目录不存在时自动创建
    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), AssistantError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| AssistantError::Internal(format!("artifact cache dir: {e}")))?;
        let data = serde_json::to_string_pretty(value)
            .map_err(|e| AssistantError::Internal(format!("artifact serialize: {e}")))?;
        std::fs::write(self.entry_path(key), data)
            .map_err(|e| AssistantError::Internal(format!("artifact write: {e}")))?;
        tracing::debug!(key, "artifact stored");
        Ok(())
    }

    /// 删除指纹对应的工件；不存在时静默成功
    pub fn invalidate(&self, key: &str) {
        match std::fs::remove_file(self.entry_path(key)) {
            Ok(()) => tracing::debug!(key, "artifact invalidated"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(key, error = %err, "artifact invalidate failed"),
        }
    }
}

/// 由若干输入片段算出稳定指纹（十六进制）；输入不变则指纹不变
pub fn fingerprint<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    // DefaultHasher::new 用固定密钥，跨进程稳定
    let mut hasher = DefaultHasher::new();
    for part in parts {
        hasher.write(part.as_ref().as_bytes());
        hasher.write_u8(0xff);
    }
    format!("{:016x}", hasher.finish())
}
