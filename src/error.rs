// 上传错误分类
//
// 错误分为四类，重试策略不同：
// - Cancelled：协作式取消，立即向上传播，永不重试
// - Transient：网络/服务端瞬时故障，由重试执行器按指数退避重试
// - Structural：结构性失败（如合并时服务端缺分片），重试无意义
// - Io：本地文件读取失败，不重试

use thiserror::Error;

/// 上传过程中的错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 任务已被取消
    #[error("上传已取消")]
    Cancelled,

    /// 瞬时传输故障（可重试）
    #[error("传输失败: {0}")]
    Transient(String),

    /// 结构性失败（不可重试）
    #[error("{0}")]
    Structural(String),

    /// 本地 IO 错误
    #[error("本地 IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// 是否可以重试
    ///
    /// 只有瞬时传输故障值得重试；取消和结构性失败立即终止，
    /// 本地文件读不出来重试也读不出来
    pub fn is_retriable(&self) -> bool {
        matches!(self, UploadError::Transient(_))
    }

    /// 是否为取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}
