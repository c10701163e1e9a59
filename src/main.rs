//! Valet - 个人助手入口
//!
//! 初始化日志、加载配置、装配编排器，然后在 stdin 上跑一个 REPL，
//! 直到 EOF、exit 命令或系统信号触发优雅关闭。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use valet::core::{run_with_graceful_shutdown, ShutdownManager};
use valet::{Orchestrator, OrchestratorBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    valet::observability::init();

    // 唯一的命令行参数是可选的配置文件路径
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = valet::load_config(config_path).context("Failed to load configuration")?;

    let orchestrator = Arc::new(
        OrchestratorBuilder::new(config)
            .build()
            .await
            .context("Failed to assemble the orchestrator")?,
    );

    let manager = Arc::new(ShutdownManager::new());
    let repl_orchestrator = orchestrator.clone();
    run_with_graceful_shutdown(manager, repl(repl_orchestrator), move || async move {
        orchestrator.shutdown().await;
    })
    .await;

    Ok(())
}

/// stdin REPL。每一行是一条请求；exit 或 EOF 退出。
async fn repl(orchestrator: Arc<Orchestrator>) {
    println!("Valet - personal assistant (user: {})", orchestrator.user_id());
    println!("Type a request in plain English, 'exit' to quit.\n");
    println!("{}", command_reference());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        match lines.next_line().await {
            Ok(Some(line)) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
                    break;
                }
                if input.eq_ignore_ascii_case("help") {
                    println!("{}", command_reference());
                    continue;
                }
                let reply = orchestrator.handle(orchestrator.user_id(), input).await;
                println!("{reply}\n");
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read from stdin");
                break;
            }
        }
    }
}

fn command_reference() -> &'static str {
    "Examples:\n\
     \x20 check my mail\n\
     \x20 send mail to bob@example.com subject: Hi body: Lunch on Friday?\n\
     \x20 add task: buy milk due friday\n\
     \x20 list tasks\n\
     \x20 task insights\n\
     \x20 select * from tasks\n\
     \x20 search for rust async runtimes\n\
     \x20 schedule meeting with bob@example.com at 3 pm on monday\n\
     \x20 reschedule summary to 7 am\n\
     \x20 who are you\n"
}
