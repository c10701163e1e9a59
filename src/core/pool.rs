//! 资源池：昂贵句柄的有界复用
//!
//! 空闲集 + 懒增长：先取空闲句柄，无则在 max_size 内新建，满则等待归还，
//! 等待超时返回 PoolExhausted。取出的句柄由 RAII guard 持有，任何退出路径
//! （含错误与超时取消）都会归还；损坏的句柄用 discard 丢弃并腾出名额。

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::Notify;

use crate::core::AssistantError;

/// 句柄工厂：池在预热与懒增长时调用
#[async_trait]
pub trait HandleFactory<T>: Send + Sync {
    async fn create(&self) -> Result<T, AssistantError>;
}

/// 池配置；min_idle 个句柄在预热时创建，其余按需
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

struct PoolState<T> {
    idle: VecDeque<T>,
    /// 当前存在的句柄总数（空闲 + 已取出 + 正在创建）
    total: usize,
    closed: bool,
}

/// 有界资源池；通过 Arc 共享，acquire 返回的 guard 在 Drop 时归还
pub struct ResourcePool<T: Send + 'static> {
    name: &'static str,
    factory: Arc<dyn HandleFactory<T>>,
    config: PoolConfig,
    state: Mutex<PoolState<T>>,
    returned: Notify,
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new(
        name: &'static str,
        factory: Arc<dyn HandleFactory<T>>,
        config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                closed: false,
            }),
            returned: Notify::new(),
        })
    }

    /// 预先创建 min_idle 个句柄；任一失败即失败（启动期强制资源检查）
    pub async fn warm_up(self: &Arc<Self>) -> Result<(), AssistantError> {
        let target = self.config.min_idle.min(self.config.max_size);
        if target == 0 {
            return Ok(());
        }
        let creations = join_all((0..target).map(|_| self.factory.create())).await;
        let mut state = self.state.lock().expect("pool state lock poisoned");
        for created in creations {
            let handle = created?;
            state.idle.push_back(handle);
            state.total += 1;
        }
        tracing::info!(pool = self.name, handles = target, "pool warmed up");
        Ok(())
    }

    /// 取出一个句柄：空闲优先，其次新建，满则等待归还直到超时
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledHandle<T>, AssistantError> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        loop {
            {
                let mut state = self.state.lock().expect("pool state lock poisoned");
                if state.closed {
                    return Err(AssistantError::PoolExhausted {
                        resource: self.name,
                    });
                }
                if let Some(handle) = state.idle.pop_front() {
                    return Ok(PooledHandle::checked_out(handle, self.clone()));
                }
                if state.total < self.config.max_size {
                    // 预占名额，锁外创建
                    state.total += 1;
                    break;
                }
            }

            tokio::select! {
                _ = self.returned.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(pool = self.name, max_size = self.config.max_size, "acquire timed out, pool exhausted");
                    return Err(AssistantError::PoolExhausted { resource: self.name });
                }
            }
        }

        match self.factory.create().await {
            Ok(handle) => {
                tracing::debug!(pool = self.name, "created new handle");
                Ok(PooledHandle::checked_out(handle, self.clone()))
            }
            Err(err) => {
                // 创建失败必须退还名额，否则池会永久缩水
                let mut state = self.state.lock().expect("pool state lock poisoned");
                state.total -= 1;
                drop(state);
                self.returned.notify_one();
                Err(err)
            }
        }
    }

    /// 关闭池：清空空闲句柄，等待在途句柄归还（有限等待）
    pub async fn shutdown(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("pool state lock poisoned");
            state.closed = true;
            let drained = state.idle.len();
            state.idle.clear();
            state.total -= drained;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let in_flight = {
                let state = self.state.lock().expect("pool state lock poisoned");
                state.total
            };
            if in_flight == 0 {
                break;
            }
            tokio::select! {
                _ = self.returned.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(pool = self.name, in_flight, "shutdown timed out with handles in flight");
                    break;
                }
            }
        }
        tracing::info!(pool = self.name, "pool shut down");
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().expect("pool state lock poisoned").idle.len()
    }

    pub fn total_count(&self) -> usize {
        self.state.lock().expect("pool state lock poisoned").total
    }
}

/// 取出句柄的 RAII guard：Drop 归还（池已关闭或 discard 时销毁并减计数）
pub struct PooledHandle<T: Send + 'static> {
    handle: Option<T>,
    pool: Arc<ResourcePool<T>>,
    broken: bool,
}

impl<T: Send + 'static> PooledHandle<T> {
    fn checked_out(handle: T, pool: Arc<ResourcePool<T>>) -> Self {
        Self {
            handle: Some(handle),
            pool,
            broken: false,
        }
    }

    /// 句柄已损坏：丢弃而非归还，名额让给后续新建
    pub fn discard(mut self) {
        self.broken = true;
    }
}

impl<T: Send + 'static> Deref for PooledHandle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.handle.as_ref().expect("handle present until drop")
    }
}

impl<T: Send + 'static> DerefMut for PooledHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.handle.as_mut().expect("handle present until drop")
    }
}

impl<T: Send + 'static> Drop for PooledHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let mut state = self.pool.state.lock().expect("pool state lock poisoned");
            if self.broken || state.closed {
                state.total -= 1;
                drop(state);
                drop(handle);
                tracing::debug!(pool = self.pool.name, "handle discarded");
            } else {
                state.idle.push_back(handle);
                drop(state);
            }
            self.pool.returned.notify_one();
        }
    }
}
