use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rule_tunnel::config::load_config;
use rule_tunnel::executor::Executor;
use rule_tunnel::logger::init_logger;
use rule_tunnel::metrics::Metrics;
use rule_tunnel::tunnel::{Snapshot, Tunnel};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main(flavor = "multi_thread", worker_threads = 16)]
async fn main() -> Result<()> {
    // 读取配置文件路径（命令行参数或默认值）
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = load_config(&config_path)?;

    let log_settings = config.general.log.clone();
    init_logger(log_settings.to_log_config())
        .map_err(|e| anyhow::anyhow!("初始化日志系统失败: {}", e))?;

    log::info!("=== rule-tunnel 启动 ===");
    log::info!("配置文件: {}", config_path);
    log::info!("日志级别: {} | 输出: {}", log_settings.level(), log_settings.output);
    if log_settings.enable_rotation {
        log::info!(
            "日志轮转: 启用 ({}MB per file, {} backups)",
            log_settings.max_size_mb,
            log_settings.max_backups
        );
    }
    if let Some(addr) = config.general.socks_addr {
        log::info!("SOCKS5 监听: {}", addr);
    }
    if let Some(addr) = config.general.redir_addr {
        log::info!("REDIR 监听: {}", addr);
    }
    log::info!(
        "加载了 {} 个代理/代理组, {} 条规则",
        config.proxy_names.len(),
        config.snapshot.rules.len()
    );

    let metrics = Metrics::new();
    let tunnel = Tunnel::new(Snapshot::default(), metrics.clone());
    let executor = Arc::new(Executor::new(Arc::clone(&tunnel)));
    executor
        .apply_config(config, true)
        .await
        .context("应用配置失败")?;

    spawn_housekeeping(Arc::clone(&tunnel));
    spawn_reload(Arc::clone(&executor), config_path.clone());

    log::info!("=== 服务器准备就绪 ===");

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    log::info!("收到退出信号，正在关闭...");
    executor.shutdown().await;
    metrics.print_summary();
    Ok(())
}

/// 定期输出指标，并回收过期的 fake-ip 映射
fn spawn_housekeeping(tunnel: Arc<Tunnel>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tunnel.metrics().print_summary();
            if let Some(pool) = tunnel.resolver().and_then(|r| r.fake_pool().cloned()) {
                let removed = pool.cleanup();
                if removed > 0 {
                    log::debug!("回收了 {} 条过期的 fake-ip 映射", removed);
                }
            }
        }
    });
}

/// SIGHUP 重新加载配置；失败时保持当前配置
#[cfg(unix)]
fn spawn_reload(executor: Arc<Executor>, config_path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("无法监听 SIGHUP，配置热重载不可用: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            log::info!("收到 SIGHUP，重新加载 {}", config_path);
            let result = match load_config(&config_path) {
                Ok(config) => executor.apply_config(config, false).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                log::error!("❌ 重新加载配置失败，继续使用当前配置: {:#}", e);
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload(_executor: Arc<Executor>, _config_path: String) {}
