// 分片调度器
//
// 对单个文件的待传分片运行一个有界工作者池：
// - 所有工作者共享同一个领取队列，一个索引只会被领取一次
// - 每个分片经由重试执行器上传，确认后立刻记入任务并推送进度
// - 共享同一个取消令牌；任一工作者遇到不可恢复错误时，
//   通过子令牌通知兄弟工作者停止领取，不留下孤儿网络活动
// - 仅当所有请求的索引都被服务端确认时才算成功

use crate::error::UploadError;
use crate::store::RemoteStore;
use crate::uploader::chunk::UploadChunk;
use crate::uploader::retry::{self, RetryPolicy};
use crate::uploader::task::SharedTask;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认单文件最大并发分片数
pub const DEFAULT_CONCURRENT_CHUNKS: usize = 4;

/// 分片调度器（单文件）
pub struct ChunkScheduler<S: RemoteStore> {
    store: Arc<S>,
    task: SharedTask,
    cancel_token: CancellationToken,
    policy: RetryPolicy,
    max_concurrent: usize,
}

impl<S: RemoteStore> ChunkScheduler<S> {
    pub fn new(
        store: Arc<S>,
        task: SharedTask,
        cancel_token: CancellationToken,
        policy: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            task,
            cancel_token,
            policy,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 上传给定的待传分片集合
    ///
    /// 返回 Ok 当且仅当每个请求的索引都已被确认记入 uploaded_chunks。
    /// 外部取消优先于内部失败：两者同时发生时报告取消
    pub async fn run(&self, pending: Vec<UploadChunk>) -> Result<(), UploadError> {
        if pending.is_empty() {
            return Ok(());
        }

        let snapshot = self.task.snapshot().await;
        let task_id = snapshot.id.clone();
        let local_path = snapshot.local_path.clone();
        let fingerprint = snapshot
            .fingerprint
            .clone()
            .ok_or_else(|| UploadError::Structural("调度分片前必须先计算指纹".to_string()))?;
        let total_chunks = snapshot.total_chunks;

        let requested: Vec<usize> = pending.iter().map(|c| c.index).collect();
        let worker_count = self.max_concurrent.min(pending.len());

        info!(
            "任务 {} 开始分片上传: 待传分片数={}, 并发数={}",
            task_id,
            pending.len(),
            worker_count
        );

        // 共享领取队列：一个索引只会被弹出一次
        let claim_queue = Arc::new(Mutex::new(VecDeque::from(pending)));
        // 子令牌：外部取消会级联，内部失败只取消兄弟工作者
        let worker_token = self.cancel_token.child_token();
        let first_error: Arc<Mutex<Option<UploadError>>> = Arc::new(Mutex::new(None));

        let mut workers: JoinSet<()> = JoinSet::new();
        for worker_id in 1..=worker_count {
            let store = self.store.clone();
            let task = self.task.clone();
            let claim_queue = claim_queue.clone();
            let worker_token = worker_token.clone();
            let first_error = first_error.clone();
            let policy = self.policy;
            let local_path = local_path.clone();
            let fingerprint = fingerprint.clone();

            workers.spawn(async move {
                run_worker(
                    worker_id,
                    store,
                    task,
                    claim_queue,
                    worker_token,
                    first_error,
                    policy,
                    local_path,
                    fingerprint,
                    total_chunks,
                )
                .await;
            });
        }

        // 等待全部工作者退出
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("任务 {} 分片工作者异常退出: {}", task_id, e);
                let mut slot = first_error.lock();
                if slot.is_none() {
                    *slot = Some(UploadError::Structural(format!("分片工作者异常: {}", e)));
                }
                worker_token.cancel();
            }
        }

        // 外部取消优先报告
        if self.cancel_token.is_cancelled() {
            info!("任务 {} 分片上传因取消而终止", task_id);
            return Err(UploadError::Cancelled);
        }

        if let Some(e) = first_error.lock().take() {
            error!("任务 {} 分片上传失败: {}", task_id, e);
            return Err(e);
        }

        // 成功契约：每个请求的索引都必须已被确认
        let uploaded = self.task.snapshot().await.uploaded_chunks;
        for index in &requested {
            if !uploaded.contains(index) {
                return Err(UploadError::Structural(format!(
                    "分片 #{} 未被服务端确认",
                    index
                )));
            }
        }

        info!("任务 {} 全部 {} 个分片上传完成", task_id, requested.len());
        Ok(())
    }
}

/// 单个工作者循环：领取 → 读取 → 上传 → 记账，直到队列空或令牌取消
#[allow(clippy::too_many_arguments)]
async fn run_worker<S: RemoteStore>(
    worker_id: usize,
    store: Arc<S>,
    task: SharedTask,
    claim_queue: Arc<Mutex<VecDeque<UploadChunk>>>,
    worker_token: CancellationToken,
    first_error: Arc<Mutex<Option<UploadError>>>,
    policy: RetryPolicy,
    local_path: PathBuf,
    fingerprint: String,
    total_chunks: usize,
) {
    loop {
        if worker_token.is_cancelled() {
            debug!("[上传线程{}] 观察到取消信号，停止领取", worker_id);
            return;
        }

        // 领取下一个分片（锁内不 await）
        let chunk = match claim_queue.lock().pop_front() {
            Some(chunk) => chunk,
            None => return,
        };

        debug!(
            "[上传线程{}] 领取分片 #{} (范围: {}-{})",
            worker_id,
            chunk.index,
            chunk.range.start,
            chunk.range.end.saturating_sub(1)
        );

        // 读取分片字节
        let data = match chunk.read_data(&local_path).await {
            Ok(data) => data,
            Err(e) => {
                error!(
                    "[上传线程{}] 分片 #{} 读取失败: {}",
                    worker_id, chunk.index, e
                );
                record_failure(&first_error, &worker_token, e);
                return;
            }
        };

        // 经由重试执行器上传
        let result = retry::execute(&policy, &worker_token, || {
            store.upload_chunk(&fingerprint, chunk.index, total_chunks, data.clone())
        })
        .await;

        match result {
            Ok(()) => {
                // 确认即记账：在任务锁内追加索引并重算进度
                let snapshot = task.mutate(|t| t.record_chunk(chunk.index)).await;
                info!(
                    "[上传线程{}] ✓ 分片 #{} 上传成功 ({}/{} 完成)",
                    worker_id,
                    chunk.index,
                    snapshot.uploaded_chunks.len(),
                    snapshot.total_chunks
                );
            }
            Err(UploadError::Cancelled) => {
                debug!("[上传线程{}] 分片 #{} 因取消中止", worker_id, chunk.index);
                return;
            }
            Err(e) => {
                warn!(
                    "[上传线程{}] 分片 #{} 不可恢复失败，通知兄弟工作者停止: {}",
                    worker_id, chunk.index, e
                );
                record_failure(&first_error, &worker_token, e);
                return;
            }
        }
    }
}

/// 记录首个不可恢复错误，并取消兄弟工作者
fn record_failure(
    first_error: &Arc<Mutex<Option<UploadError>>>,
    worker_token: &CancellationToken,
    error: UploadError,
) {
    {
        let mut slot = first_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }
    worker_token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullStatusListener;
    use crate::store::{CheckResponse, MergeResponse};
    use crate::uploader::chunk::plan_chunks;
    use crate::uploader::task::{SharedTask, UploadTask};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    /// 可编排故障的测试存储
    struct ScriptedStore {
        /// 每个分片上传前的人工延迟
        upload_delay: Duration,
        /// 这些索引会返回结构性失败
        fail_indices: HashSet<usize>,
        /// 所有 upload_chunk 调用记录（索引）
        calls: Mutex<Vec<usize>>,
        /// 当前并发上传数与历史峰值
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(upload_delay: Duration, fail_indices: impl IntoIterator<Item = usize>) -> Self {
            Self {
                upload_delay,
                fail_indices: fail_indices.into_iter().collect(),
                calls: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl RemoteStore for ScriptedStore {
        async fn check(&self, _: &str, _: &str) -> Result<CheckResponse, UploadError> {
            Ok(CheckResponse {
                exists: false,
                path: None,
                uploaded_chunks: Vec::new(),
            })
        }

        async fn upload_chunk(
            &self,
            _fingerprint: &str,
            index: usize,
            _total_chunks: usize,
            _data: Vec<u8>,
        ) -> Result<(), UploadError> {
            self.calls.lock().push(index);

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.upload_delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_indices.contains(&index) {
                return Err(UploadError::Structural(format!("分片 #{} 被拒绝", index)));
            }
            Ok(())
        }

        async fn merge(&self, _: &str, _: &str, _: usize) -> Result<MergeResponse, UploadError> {
            Ok(MergeResponse {
                success: true,
                path: None,
            })
        }
    }

    /// 构造一个指纹就绪、文件落盘的共享任务
    fn make_shared_task(total_size: u64, chunk_size: u64) -> (SharedTask, NamedTempFile) {
        let mut temp_file = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..total_size).map(|i| (i % 251) as u8).collect();
        temp_file.write_all(&content).unwrap();
        temp_file.flush().unwrap();

        let mut task = UploadTask::new(
            temp_file.path().to_path_buf(),
            "test.bin".to_string(),
            total_size,
            chunk_size,
        );
        task.set_fingerprint("fp-test".to_string());

        (
            SharedTask::new(task, Arc::new(NullStatusListener)),
            temp_file,
        )
    }

    fn scheduler_with(
        store: Arc<ScriptedStore>,
        task: SharedTask,
        token: CancellationToken,
        max_concurrent: usize,
    ) -> ChunkScheduler<ScriptedStore> {
        // 测试里用很短的退避，避免拖慢用例
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 10,
        };
        ChunkScheduler::new(store, task, token, policy, max_concurrent)
    }

    #[tokio::test]
    async fn test_uploads_every_chunk_exactly_once() {
        let (task, _file) = make_shared_task(8 * 1024, 1024);
        let store = Arc::new(ScriptedStore::new(Duration::from_millis(5), []));
        let scheduler = scheduler_with(store.clone(), task.clone(), CancellationToken::new(), 3);

        let pending = plan_chunks(8 * 1024, 1024);
        scheduler.run(pending).await.unwrap();

        // 每个索引恰好上传一次
        let mut calls = store.calls.lock().clone();
        calls.sort_unstable();
        assert_eq!(calls, (0..8).collect::<Vec<_>>());

        // 全部记入任务
        let snapshot = task.snapshot().await;
        assert_eq!(snapshot.uploaded_chunks.len(), 8);
        assert_eq!(snapshot.progress, 100);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_bound() {
        let (task, _file) = make_shared_task(16 * 1024, 1024);
        let store = Arc::new(ScriptedStore::new(Duration::from_millis(10), []));
        let scheduler = scheduler_with(store.clone(), task, CancellationToken::new(), 3);

        scheduler.run(plan_chunks(16 * 1024, 1024)).await.unwrap();

        assert!(store.max_active.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_worker_count_capped_by_pending_len() {
        let (task, _file) = make_shared_task(2 * 1024, 1024);
        let store = Arc::new(ScriptedStore::new(Duration::from_millis(5), []));
        // 并发名额 8，但只有 2 个分片
        let scheduler = scheduler_with(store.clone(), task, CancellationToken::new(), 8);

        scheduler.run(plan_chunks(2 * 1024, 1024)).await.unwrap();
        assert!(store.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_cancels_siblings() {
        let (task, _file) = make_shared_task(32 * 1024, 1024);
        // 分片 #0 结构性失败，其余正常但各需 20ms
        let store = Arc::new(ScriptedStore::new(Duration::from_millis(20), [0]));
        let scheduler = scheduler_with(store.clone(), task.clone(), CancellationToken::new(), 2);

        let result = scheduler.run(plan_chunks(32 * 1024, 1024)).await;
        assert!(matches!(result, Err(UploadError::Structural(_))));

        // 兄弟工作者停止领取：32 个分片远没有全部被尝试
        let calls_at_settle = store.call_count();
        assert!(
            calls_at_settle < 32,
            "兄弟工作者未被取消: {}",
            calls_at_settle
        );

        // 结算后不再有孤儿上传活动
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.call_count(), calls_at_settle);
    }

    #[tokio::test]
    async fn test_external_cancellation_wins_over_failure() {
        let (task, _file) = make_shared_task(16 * 1024, 1024);
        let store = Arc::new(ScriptedStore::new(Duration::from_millis(50), []));
        let token = CancellationToken::new();
        let scheduler = scheduler_with(store.clone(), task.clone(), token.clone(), 2);

        let cancel_token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_token.cancel();
        });

        let result = scheduler.run(plan_chunks(16 * 1024, 1024)).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));

        // 未完成全部上传
        let snapshot = task.snapshot().await;
        assert!(snapshot.uploaded_chunks.len() < 16);
    }

    #[tokio::test]
    async fn test_empty_pending_is_noop() {
        let (task, _file) = make_shared_task(1024, 1024);
        let store = Arc::new(ScriptedStore::new(Duration::ZERO, []));
        let scheduler = scheduler_with(store.clone(), task, CancellationToken::new(), 4);

        scheduler.run(Vec::new()).await.unwrap();
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_fingerprint_is_structural_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&[0u8; 1024]).unwrap();
        temp_file.flush().unwrap();

        // 不设置指纹
        let task = UploadTask::new(
            temp_file.path().to_path_buf(),
            "test.bin".to_string(),
            1024,
            1024,
        );
        let shared = SharedTask::new(task, Arc::new(NullStatusListener));

        let store = Arc::new(ScriptedStore::new(Duration::ZERO, []));
        let scheduler = scheduler_with(store, shared, CancellationToken::new(), 2);

        let result = scheduler.run(plan_chunks(1024, 1024)).await;
        assert!(matches!(result, Err(UploadError::Structural(_))));
    }
}
