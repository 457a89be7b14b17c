// 远端存储契约
//
// 编排器只依赖三个可插拔的远端操作（检查 / 分片上传 / 合并），
// 不关心底层传输。LocalStore 是契约的参考实现，落在本地文件系统上

pub mod local;

pub use local::LocalStore;

use crate::error::UploadError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 秒传/续传检查结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    /// 服务端是否已持有该指纹对应的完整内容
    pub exists: bool,
    /// exists=true 时的服务端路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// exists=false 时，服务端已持有的分片索引（续传起点）
    #[serde(default)]
    pub uploaded_chunks: Vec<usize>,
}

/// 合并结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResponse {
    /// 是否合并成功（任一分片缺失时必须为 false）
    pub success: bool,
    /// 成功时的服务端最终路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// 远端存储
///
/// 三个操作的契约：
/// - `check`：exists=true 表示可以整体跳过上传；否则返回可续传的分片集合，
///   同样入参重复调用必须返回同样结果
/// - `upload_chunk`：对调用方幂等，重传已存在的分片不会破坏状态
/// - `merge`：所有分片就绪后调用才会成功；缺分片时返回 success=false
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// 秒传/续传检查
    async fn check(&self, fingerprint: &str, file_name: &str)
        -> Result<CheckResponse, UploadError>;

    /// 上传单个分片
    async fn upload_chunk(
        &self,
        fingerprint: &str,
        index: usize,
        total_chunks: usize,
        data: Vec<u8>,
    ) -> Result<(), UploadError>;

    /// 合并全部分片
    async fn merge(
        &self,
        fingerprint: &str,
        file_name: &str,
        total_chunks: usize,
    ) -> Result<MergeResponse, UploadError>;
}
