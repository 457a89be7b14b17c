//! 日志系统配置
//!
//! 控制台始终输出；启用文件持久化时额外按天滚动写入日志目录

use crate::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 初始化日志系统
///
/// 级别优先取 RUST_LOG 环境变量，否则用配置里的 level。
/// 返回的 guard 在存活期间保证文件日志落盘，调用方需持有到进程结束
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string());
    let console_layer = fmt::layer().with_timer(timer.clone());

    if config.enabled {
        let appender = tracing_appender::rolling::daily(&config.log_dir, "bigfile-upload.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer()
            .with_timer(timer)
            .with_ansi(false)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        None
    }
}
