//! 优雅关闭
//!
//! 统一的关闭信号入口：Ctrl+C、SIGTERM 和 REPL 的 quit 命令都走同一个
//! token。编排器监听 token 后按固定顺序收尾（停调度、关资源池、清缓存）。

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// 关闭原因，进日志
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// 用户发起（Ctrl+C 或 quit 命令）
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 致命错误
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// 供后台任务监听取消
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭
    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "shutdown requested");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器（Ctrl+C，Unix 下另加 SIGTERM）
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = wait_for_signal().await;
            manager.shutdown(reason);
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable, Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return ShutdownReason::UserInitiated;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::UserInitiated,
        _ = sigterm.recv() => ShutdownReason::Signal,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownReason {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownReason::UserInitiated
}

/// 运行主循环直到结束或收到关闭信号，然后执行收尾
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("application finished normally");
        }
        _ = manager.wait_for_shutdown() => {
            tracing::info!("shutdown signal received");
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_manager_is_not_shutdown() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
    }

    #[test]
    fn test_shutdown_cancels_shared_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_unblocks_on_signal() {
        let manager = Arc::new(ShutdownManager::new());
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_for_shutdown().await })
        };
        manager.shutdown(ShutdownReason::FatalError("boom".into()));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_shutdown_signal() {
        let manager = Arc::new(ShutdownManager::new());
        let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let flag = cleaned.clone();
        let inner = manager.clone();
        run_with_graceful_shutdown(
            manager,
            async move {
                inner.shutdown(ShutdownReason::UserInitiated);
                // 模拟被信号打断的主循环
                std::future::pending::<()>().await;
            },
            move || async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            },
        )
        .await;

        assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));
    }
}
