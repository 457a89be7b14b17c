// Bigfile Upload Rust Library
// 大文件分片上传编排核心库

// 配置管理模块
pub mod config;

// 错误分类模块
pub mod error;

// 状态通知模块
pub mod events;

// 日志模块
pub mod logging;

// 远端存储契约与参考实现
pub mod store;

// 上传编排模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, LogConfig, StoreConfig, UploadConfig};
pub use error::UploadError;
pub use events::{ChannelStatusListener, NullStatusListener, StatusListener};
pub use store::{CheckResponse, LocalStore, MergeResponse, RemoteStore};
pub use uploader::{
    ChunkScheduler, FileFingerprint, Fingerprinter, RetryPolicy, SharedTask, UploadChunk,
    UploadEngine, UploadManager, UploadTask, UploadTaskStatus,
};
