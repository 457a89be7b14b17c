// 上传编排模块
//
// 分层（自下而上）：
// - retry：单个异步操作的有界重试 + 指数退避
// - chunk：固定大小分片划分与字节读取
// - fingerprint：内容指纹（秒传/续传的键）
// - scheduler：单文件分片工作者池（共享领取队列 + 兄弟取消）
// - engine：单文件状态机（检查 → 秒传/上传 → 合并）
// - manager：全局队列与文件级并发控制

pub mod chunk;
pub mod engine;
pub mod fingerprint;
pub mod manager;
pub mod retry;
pub mod scheduler;
pub mod task;

pub use chunk::{
    clamp_chunk_size, pending_chunks, plan_chunks, UploadChunk, DEFAULT_CHUNK_SIZE,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use engine::UploadEngine;
pub use fingerprint::{FileFingerprint, Fingerprinter};
pub use manager::UploadManager;
pub use retry::{RetryPolicy, DEFAULT_MAX_RETRIES};
pub use scheduler::{ChunkScheduler, DEFAULT_CONCURRENT_CHUNKS};
pub use task::{SharedTask, UploadTask, UploadTaskStatus};
