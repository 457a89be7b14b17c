// 上传引擎
//
// 驱动单个文件走完整个状态机：
//   checking：计算指纹 → 远端检查
//     → 命中：秒传成功，零网络活动收尾
//     → 未命中：吸收服务端已持有的分片（续传），算出待传集合
//   uploading：分片调度器把待传分片全部送达
//   merging：通知服务端合并；缺分片被拒绝属结构性失败，不重试
//
// 引擎是唯一写入终态的地方：正常完成、错误、取消都在 settle 中收口，
// 其他文件的在途工作不受本文件失败影响

use crate::error::UploadError;
use crate::store::RemoteStore;
use crate::uploader::chunk::{pending_chunks, plan_chunks};
use crate::uploader::fingerprint::Fingerprinter;
use crate::uploader::retry::{self, RetryPolicy};
use crate::uploader::scheduler::ChunkScheduler;
use crate::uploader::task::SharedTask;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 上传引擎（单文件状态机）
pub struct UploadEngine<S: RemoteStore> {
    store: Arc<S>,
    task: SharedTask,
    cancel_token: CancellationToken,
    policy: RetryPolicy,
    max_concurrent_chunks: usize,
}

impl<S: RemoteStore> UploadEngine<S> {
    pub fn new(
        store: Arc<S>,
        task: SharedTask,
        cancel_token: CancellationToken,
        policy: RetryPolicy,
        max_concurrent_chunks: usize,
    ) -> Self {
        Self {
            store,
            task,
            cancel_token,
            policy,
            max_concurrent_chunks,
        }
    }

    /// 执行到终态
    ///
    /// 所有结局（成功/失败/取消）都落在任务状态里，不向调用方抛错
    pub async fn run(&self) {
        let task_id = self.task.snapshot().await.id;

        match self.drive().await {
            Ok(()) => {}
            Err(UploadError::Cancelled) => {
                info!("任务 {} 已取消", task_id);
                self.task.mutate(|t| t.mark_cancelled()).await;
            }
            Err(e) => {
                error!("任务 {} 失败: {}", task_id, e);
                self.task.mutate(|t| t.mark_failed(e.to_string())).await;
            }
        }
    }

    /// 状态机主流程
    async fn drive(&self) -> Result<(), UploadError> {
        self.ensure_not_cancelled()?;

        // ---- checking ----
        let snapshot = self.task.mutate(|t| t.mark_checking()).await;
        let task_id = snapshot.id.clone();

        info!(
            "任务 {} 开始检查: file={}, size={}, 分片数={}",
            task_id, snapshot.file_name, snapshot.total_size, snapshot.total_chunks
        );

        // 计算内容指纹（阻塞线程池中流式哈希，必要时自动降级）
        let fingerprint =
            Fingerprinter::compute(&snapshot.local_path, snapshot.chunk_size).await?;
        let digest = fingerprint.digest;
        self.task
            .mutate(|t| t.set_fingerprint(digest.clone()))
            .await;

        self.ensure_not_cancelled()?;

        // 远端秒传/续传检查
        let check = retry::execute(&self.policy, &self.cancel_token, || {
            self.store.check(&digest, &snapshot.file_name)
        })
        .await?;

        if check.exists {
            // 秒传：服务端已持有该内容，零分片、零合并
            info!("任务 {} 秒传命中: path={:?}", task_id, check.path);
            self.task
                .mutate(|t| t.mark_instant_success(check.path.clone()))
                .await;
            return Ok(());
        }

        // 吸收服务端已持有的分片（越界索引在 record_chunk 中被过滤）
        let resumed = check.uploaded_chunks.len();
        if resumed > 0 {
            info!("任务 {} 续传: 服务端已持有 {} 个分片", task_id, resumed);
            self.task
                .mutate(|t| {
                    for index in check.uploaded_chunks.iter().copied() {
                        t.record_chunk(index);
                    }
                })
                .await;
        }

        // 计算待传分片集合
        let uploaded = self.task.snapshot().await.uploaded_chunks;
        let pending = pending_chunks(
            plan_chunks(snapshot.total_size, snapshot.chunk_size),
            &uploaded,
        );

        // ---- uploading ----
        if !pending.is_empty() {
            self.task.mutate(|t| t.mark_uploading()).await;

            let scheduler = ChunkScheduler::new(
                self.store.clone(),
                self.task.clone(),
                self.cancel_token.clone(),
                self.policy,
                self.max_concurrent_chunks,
            );
            scheduler.run(pending).await?;
        } else {
            info!("任务 {} 所有分片已在服务端，直接进入合并", task_id);
        }

        self.ensure_not_cancelled()?;

        // ---- merging ----
        self.task.mutate(|t| t.mark_merging()).await;

        let merge = retry::execute(&self.policy, &self.cancel_token, || {
            self.store
                .merge(&digest, &snapshot.file_name, snapshot.total_chunks)
        })
        .await?;

        if !merge.success {
            // 服务端缺分片：重传不可能修复，属结构性失败
            return Err(UploadError::Structural(
                "合并被拒绝：服务端报告分片缺失".to_string(),
            ));
        }

        info!("任务 {} 合并完成: path={:?}", task_id, merge.path);
        self.task
            .mutate(|t| t.mark_success(merge.path.clone()))
            .await;

        Ok(())
    }

    fn ensure_not_cancelled(&self) -> Result<(), UploadError> {
        if self.cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }
}
