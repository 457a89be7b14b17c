// 上传任务定义
//
// 状态机（单向，不回头）：
//   pending → checking → success（秒传）
//   pending → checking → uploading → merging → success
//   checking/uploading/merging 任一阶段可进入 error / cancelled
// success / error / cancelled 为终态，进入后任务不可变

use crate::events::StatusListener;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 排队等待中
    Pending,
    /// 秒传/续传检查中
    Checking,
    /// 分片上传中
    Uploading,
    /// 合并分片中
    Merging,
    /// 已完成
    Success,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl UploadTaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadTaskStatus::Success | UploadTaskStatus::Error | UploadTaskStatus::Cancelled
        )
    }

    /// 是否在途（占用并发名额：checking / uploading / merging）
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            UploadTaskStatus::Checking | UploadTaskStatus::Uploading | UploadTaskStatus::Merging
        )
    }
}

/// 上传任务
///
/// 快照式结构：每次变更都会整体克隆一份发给状态监听器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 文件名（服务端可见）
    pub file_name: String,
    /// 文件总大小
    pub total_size: u64,
    /// 分片大小
    pub chunk_size: u64,
    /// 总分片数（创建时固定）
    pub total_chunks: usize,
    /// 服务端已确认的分片索引（只增不减）
    pub uploaded_chunks: BTreeSet<usize>,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 进度百分比（0-100，整数）
    pub progress: u8,
    /// 内容指纹（计算后不再变化）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// 错误信息（仅 status=error 时存在）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 服务端最终路径（成功后由 Check 或 Merge 返回）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    /// 是否秒传
    #[serde(default)]
    pub instant: bool,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadTask {
    /// 创建新的上传任务
    ///
    /// 分片数在创建时固定：ceil(total_size / chunk_size)。
    /// 空文件分片数为 0，检查后直接进入合并阶段
    pub fn new(local_path: PathBuf, file_name: String, total_size: u64, chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "分片大小必须大于 0");
        let total_chunks = total_size.div_ceil(chunk_size) as usize;

        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            file_name,
            total_size,
            chunk_size,
            total_chunks,
            uploaded_chunks: BTreeSet::new(),
            status: UploadTaskStatus::Pending,
            progress: 0,
            fingerprint: None,
            error: None,
            remote_path: None,
            instant: false,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 记录一个服务端已确认的分片，并重算进度
    ///
    /// 重复索引和越界索引被忽略（uploaded_chunks 只增不减，
    /// 且始终是 [0, total_chunks) 的子集）
    pub fn record_chunk(&mut self, index: usize) {
        if index >= self.total_chunks {
            warn!(
                "任务 {} 收到越界分片索引 {} (总分片数 {})，忽略",
                self.id, index, self.total_chunks
            );
            return;
        }
        self.uploaded_chunks.insert(index);
        self.recompute_progress();
    }

    /// 按当前已确认分片数重算进度百分比
    fn recompute_progress(&mut self) {
        if self.total_chunks == 0 {
            // 空文件没有分片，进度在成功时直接置 100
            return;
        }
        let ratio = self.uploaded_chunks.len() as f64 / self.total_chunks as f64;
        self.progress = (ratio * 100.0).round() as u8;
    }

    /// 设置内容指纹（只允许设置一次）
    pub fn set_fingerprint(&mut self, fingerprint: String) {
        if self.fingerprint.is_some() {
            warn!("任务 {} 指纹已存在，忽略重复设置", self.id);
            return;
        }
        self.fingerprint = Some(fingerprint);
    }

    /// 标记为检查中
    pub fn mark_checking(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = UploadTaskStatus::Checking;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = UploadTaskStatus::Uploading;
    }

    /// 标记为合并中
    pub fn mark_merging(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = UploadTaskStatus::Merging;
    }

    /// 标记为已完成
    pub fn mark_success(&mut self, remote_path: Option<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = UploadTaskStatus::Success;
        self.progress = 100;
        self.remote_path = remote_path;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为秒传成功
    pub fn mark_instant_success(&mut self, remote_path: Option<String>) {
        if self.is_terminal() {
            return;
        }
        self.instant = true;
        self.mark_success(remote_path);
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        if self.is_terminal() {
            return;
        }
        self.status = UploadTaskStatus::Error;
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = UploadTaskStatus::Cancelled;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }
}

/// 任务共享单元
///
/// 任务的所有变更都必须经过 `mutate`：锁内修改、锁外通知，
/// 保证每次变更监听器恰好收到一份快照，且回调里再读任务不会死锁
#[derive(Clone)]
pub struct SharedTask {
    inner: Arc<Mutex<UploadTask>>,
    listener: Arc<dyn StatusListener>,
}

impl SharedTask {
    /// 包装任务并绑定监听器，创建时立即推送一份初始快照
    pub fn new(task: UploadTask, listener: Arc<dyn StatusListener>) -> Self {
        // 初始（pending）快照也算一次状态变更
        let snapshot = task.clone();
        let shared = Self {
            inner: Arc::new(Mutex::new(task)),
            listener,
        };
        shared.listener.on_status_change(&snapshot);
        shared
    }

    /// 在锁内执行变更，随后把快照通知监听器并返回
    pub async fn mutate<F>(&self, f: F) -> UploadTask
    where
        F: FnOnce(&mut UploadTask),
    {
        let snapshot = {
            let mut task = self.inner.lock().await;
            f(&mut task);
            task.clone()
        };
        self.listener.on_status_change(&snapshot);
        snapshot
    }

    /// 获取当前快照（只读，不触发通知）
    pub async fn snapshot(&self) -> UploadTask {
        self.inner.lock().await.clone()
    }
}
