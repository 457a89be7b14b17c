// 上传管理器
//
// 负责管理多个上传任务：
// - 任务队列管理（FIFO 准入，完成顺序不作保证）
// - 文件级并发控制：在途任务数永不超过 max_concurrent_files
// - 在途注册表：任务ID → 取消令牌，仅在 checking/uploading/merging 期间存在
// - 取消/销毁
//
// 任何单个任务的失败都只影响它自己，管理器层面的操作不会让整个系统失败

use crate::config::UploadConfig;
use crate::events::StatusListener;
use crate::store::RemoteStore;
use crate::uploader::engine::UploadEngine;
use crate::uploader::task::{SharedTask, UploadTask};
use anyhow::Result;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 上传管理器
///
/// 必须在 Tokio 运行时内创建（构造时启动后台调度循环）
pub struct UploadManager<S: RemoteStore> {
    /// 远端存储
    store: Arc<S>,
    /// 上传配置
    config: UploadConfig,
    /// 状态监听器（注入式，所有任务共享）
    listener: Arc<dyn StatusListener>,
    /// 所有任务（task_id -> SharedTask）
    tasks: Arc<DashMap<String, SharedTask>>,
    /// 等待队列（task_id 列表，FIFO）
    waiting_queue: Arc<Mutex<VecDeque<String>>>,
    /// 在途注册表（task_id -> 取消令牌）
    running: Arc<DashMap<String, CancellationToken>>,
    /// 在途任务数
    in_flight: Arc<AtomicUsize>,
    /// 调度唤醒信号（入队和终态结算时触发）
    dispatch_signal: Arc<Notify>,
    /// 后台调度循环的停止令牌（destroy 时触发）
    shutdown: CancellationToken,
}

// 手写 Clone：所有共享状态都在 Arc 里，S 本身无需 Clone
impl<S: RemoteStore> Clone for UploadManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            listener: self.listener.clone(),
            tasks: self.tasks.clone(),
            waiting_queue: self.waiting_queue.clone(),
            running: self.running.clone(),
            in_flight: self.in_flight.clone(),
            dispatch_signal: self.dispatch_signal.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: RemoteStore> UploadManager<S> {
    /// 创建上传管理器
    pub fn new(store: Arc<S>, config: UploadConfig, listener: Arc<dyn StatusListener>) -> Self {
        info!(
            "创建上传管理器: 分片大小={}MB, 最大并发文件数={}, 单文件并发分片数={}, 最大重试={}",
            config.chunk_size_mb,
            config.max_concurrent_files,
            config.max_concurrent_chunks,
            config.max_retries
        );

        let manager = Self {
            store,
            config,
            listener,
            tasks: Arc::new(DashMap::new()),
            waiting_queue: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(DashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            dispatch_signal: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        };

        manager.start_dispatch_loop();
        manager
    }

    /// 启动后台调度循环
    ///
    /// 每收到一次唤醒信号跑一轮调度；信号在等待前到达会被 Notify 暂存，
    /// 不会丢失唤醒
    fn start_dispatch_loop(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                manager.dispatch().await;

                tokio::select! {
                    _ = manager.shutdown.cancelled() => {
                        info!("上传调度循环已停止");
                        return;
                    }
                    _ = manager.dispatch_signal.notified() => {}
                }
            }
        });
    }

    /// 批量添加文件
    ///
    /// 全部路径先校验再入队（要么全收要么全拒）。任务按调用顺序
    /// 进入等待队列，随后立即触发一轮调度。返回创建的任务ID列表
    pub async fn add_files(&self, paths: Vec<PathBuf>) -> Result<Vec<String>> {
        // 先整体校验
        let mut validated = Vec::with_capacity(paths.len());
        for path in paths {
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|e| anyhow::anyhow!("无法读取文件 {:?}: {}", path, e))?;
            if !metadata.is_file() {
                anyhow::bail!("不是普通文件: {:?}", path);
            }
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| anyhow::anyhow!("无法提取文件名: {:?}", path))?;
            validated.push((path, file_name, metadata.len()));
        }

        // 创建任务并入队
        let chunk_size = self.config.chunk_size_bytes();
        let mut ids = Vec::with_capacity(validated.len());
        {
            let mut queue = self.waiting_queue.lock().await;
            for (path, file_name, total_size) in validated {
                let task = UploadTask::new(path, file_name.clone(), total_size, chunk_size);
                let id = task.id.clone();

                info!(
                    "任务 {} 已创建: file={}, size={}, 分片数={}",
                    id, file_name, total_size, task.total_chunks
                );

                self.tasks
                    .insert(id.clone(), SharedTask::new(task, self.listener.clone()));
                queue.push_back(id.clone());
                ids.push(id);
            }
        }

        self.dispatch_signal.notify_one();
        Ok(ids)
    }

    /// 添加单个文件
    pub async fn add_file(&self, path: PathBuf) -> Result<String> {
        let ids = self.add_files(vec![path]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("任务创建失败"))
    }

    /// 调度循环：队列非空且在途数低于上限时，弹出队首启动状态机
    ///
    /// 弹出、登记注册表、递增在途数都在队列锁内完成，
    /// 并发触发的多轮调度不可能把在途数推过上限
    async fn dispatch(&self) {
        loop {
            let (task_id, shared, token) = {
                let mut queue = self.waiting_queue.lock().await;

                if self.in_flight.load(Ordering::SeqCst) >= self.config.max_concurrent_files {
                    return;
                }
                let Some(task_id) = queue.pop_front() else {
                    return;
                };
                let Some(shared) = self.tasks.get(&task_id).map(|e| e.value().clone()) else {
                    // 任务已被销毁，跳过
                    continue;
                };

                let token = CancellationToken::new();
                self.running.insert(task_id.clone(), token.clone());
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                (task_id, shared, token)
            };

            info!(
                "任务 {} 出队开始执行 (在途: {}/{})",
                task_id,
                self.in_flight.load(Ordering::SeqCst),
                self.config.max_concurrent_files
            );

            let manager = self.clone();
            let engine = UploadEngine::new(
                self.store.clone(),
                shared,
                token,
                self.config.retry_policy(),
                self.config.max_concurrent_chunks,
            );

            tokio::spawn(async move {
                engine.run().await;

                // 终态结算：释放注册表条目和并发名额，唤醒调度循环补位
                manager.running.remove(&task_id);
                manager.in_flight.fetch_sub(1, Ordering::SeqCst);
                manager.dispatch_signal.notify_one();
            });
        }
    }

    /// 取消一个任务
    ///
    /// 排队中的任务直接出队标记取消（从未发生网络活动）；
    /// 在途任务触发其取消令牌，由状态机异步收口到 cancelled
    pub async fn cancel_upload(&self, task_id: &str) -> Result<()> {
        // 在途：触发令牌并摘除注册表条目
        if let Some((_, token)) = self.running.remove(task_id) {
            token.cancel();
            info!("任务 {} 取消信号已发出（在途）", task_id);
            return Ok(());
        }

        // 排队中：出队并直接标记
        let dequeued = {
            let mut queue = self.waiting_queue.lock().await;
            if let Some(pos) = queue.iter().position(|id| id == task_id) {
                queue.remove(pos);
                true
            } else {
                false
            }
        };
        if dequeued {
            if let Some(shared) = self.tasks.get(task_id).map(|e| e.value().clone()) {
                shared.mutate(|t| t.mark_cancelled()).await;
            }
            info!("任务 {} 已从等待队列移除并取消", task_id);
            return Ok(());
        }

        // 调度正把任务从队列挪进注册表的窗口期：再查一次注册表
        if let Some((_, token)) = self.running.remove(task_id) {
            token.cancel();
            info!("任务 {} 取消信号已发出（在途）", task_id);
            return Ok(());
        }

        anyhow::bail!("任务 {} 不存在或已结束", task_id)
    }

    /// 销毁管理器：取消所有在途任务，清空队列和任务列表
    ///
    /// 可重复调用。销毁后管理器不再调度新任务
    pub async fn destroy(&self) {
        // 停止后台调度循环
        self.shutdown.cancel();

        // 先清空等待队列：出队和登记注册表在同一把队列锁内完成，
        // 排空之后新的在途任务不可能再出现，随后的注册表扫描不会漏网
        let drained: Vec<String> = {
            let mut queue = self.waiting_queue.lock().await;
            queue.drain(..).collect()
        };

        // 取消全部在途任务
        for entry in self.running.iter() {
            entry.value().cancel();
        }
        self.running.clear();

        // 队列中的任务标记为取消
        for task_id in &drained {
            if let Some(shared) = self.tasks.get(task_id).map(|e| e.value().clone()) {
                shared.mutate(|t| t.mark_cancelled()).await;
            }
        }

        if !drained.is_empty() || !self.tasks.is_empty() {
            warn!(
                "上传管理器销毁: 清空 {} 个排队任务, {} 个任务记录",
                drained.len(),
                self.tasks.len()
            );
        }
        self.tasks.clear();
    }

    /// 获取单个任务快照
    pub async fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        let shared = self.tasks.get(task_id).map(|e| e.value().clone())?;
        Some(shared.snapshot().await)
    }

    /// 获取所有任务快照（按创建时间排序）
    pub async fn get_all_tasks(&self) -> Vec<UploadTask> {
        let shareds: Vec<SharedTask> = self.tasks.iter().map(|e| e.value().clone()).collect();
        let mut tasks = Vec::with_capacity(shareds.len());
        for shared in shareds {
            tasks.push(shared.snapshot().await);
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// 在途任务数
    pub fn active_task_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 排队任务数
    pub async fn queued_task_count(&self) -> usize {
        self.waiting_queue.lock().await.len()
    }

    /// 清理终态任务，返回清理数量
    pub async fn clear_finished(&self) -> usize {
        let mut removed = 0;
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let Some(shared) = self.tasks.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            if shared.snapshot().await.is_terminal() {
                self.tasks.remove(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("已清理 {} 个终态任务", removed);
        }
        removed
    }
}
