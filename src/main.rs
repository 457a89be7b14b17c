// 演示入口
//
// 用法：bigfile-upload-rust <文件...>
// 把命令行指定的文件上传到本地参考存储，实时打印任务快照，
// 全部任务进入终态后退出

use anyhow::Result;
use bigfile_upload_rust::{
    logging, AppConfig, ChannelStatusListener, LocalStore, UploadManager, UploadTaskStatus,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// 默认配置文件路径
const CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let _log_guard = logging::init_logging(&config.log);

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        eprintln!("用法: bigfile-upload-rust <文件...>");
        std::process::exit(2);
    }

    info!("目标存储: {:?}", config.store.root);
    let store = Arc::new(LocalStore::open(config.store.root.clone()).await?);

    let (listener, mut status_rx) = ChannelStatusListener::channel();
    let manager = UploadManager::new(store, config.upload.clone(), listener);

    let ids = manager.add_files(paths).await?;
    info!("已添加 {} 个上传任务", ids.len());

    // 消费状态快照直到所有任务进入终态
    let mut statuses: HashMap<String, UploadTaskStatus> = HashMap::new();
    while let Some(snapshot) = status_rx.recv().await {
        let changed = statuses.get(&snapshot.id) != Some(&snapshot.status);
        statuses.insert(snapshot.id.clone(), snapshot.status);

        if changed {
            info!(
                "任务 {} [{}] 状态: {:?} 进度: {}%",
                snapshot.id, snapshot.file_name, snapshot.status, snapshot.progress
            );
        }

        let all_terminal = ids.len() == statuses.len()
            && ids
                .iter()
                .all(|id| statuses.get(id).is_some_and(|s| s.is_terminal()));
        if all_terminal {
            break;
        }
    }

    // 汇总
    let mut failed = 0usize;
    for id in &ids {
        if let Some(task) = manager.get_task(id).await {
            match task.status {
                UploadTaskStatus::Success => {
                    let tag = if task.instant { "秒传" } else { "上传" };
                    println!(
                        "{} 成功: {} -> {}",
                        tag,
                        task.file_name,
                        task.remote_path.as_deref().unwrap_or("?")
                    );
                }
                UploadTaskStatus::Error => {
                    failed += 1;
                    println!(
                        "失败: {} ({})",
                        task.file_name,
                        task.error.as_deref().unwrap_or("未知错误")
                    );
                }
                status => println!("{}: {:?}", task.file_name, status),
            }
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
