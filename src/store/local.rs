// 本地文件系统存储
//
// RemoteStore 契约的参考实现：
// - 分片落在指纹命名的临时目录 chunks/<fingerprint>/<index>.part
// - 合并时按索引顺序拼接到 files/ 下，然后删除临时目录
// - 指纹 → 最终路径 记录在 index.json，跨进程持久，
//   后续任何同内容文件的 Check 都直接命中（内容寻址去重）

use crate::error::UploadError;
use crate::store::{CheckResponse, MergeResponse, RemoteStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 持久索引文件名
const INDEX_FILE: &str = "index.json";

/// 分片临时区目录名
const CHUNK_DIR: &str = "chunks";

/// 最终文件目录名
const FILE_DIR: &str = "files";

/// 分片文件后缀
const PART_SUFFIX: &str = ".part";

/// 本地文件系统存储
pub struct LocalStore {
    /// 存储根目录
    root: PathBuf,
    /// 指纹 → 最终路径（内存视图，变更后立刻写回 index.json）
    index: RwLock<HashMap<String, String>>,
}

impl LocalStore {
    /// 打开（或初始化）一个本地存储
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let root = root.into();
        fs::create_dir_all(root.join(CHUNK_DIR)).await?;
        fs::create_dir_all(root.join(FILE_DIR)).await?;

        // 加载持久索引
        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            let content = fs::read_to_string(&index_path).await?;
            serde_json::from_str(&content).map_err(|e| {
                UploadError::Structural(format!("存储索引文件损坏: {}", e))
            })?
        } else {
            HashMap::new()
        };

        info!("本地存储已打开: root={:?}", root);

        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    /// 指纹对应的分片临时目录
    fn chunk_dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join(CHUNK_DIR).join(fingerprint)
    }

    /// 分片文件路径
    fn chunk_path(&self, fingerprint: &str, index: usize) -> PathBuf {
        self.chunk_dir(fingerprint)
            .join(format!("{}{}", index, PART_SUFFIX))
    }

    /// 最终文件路径（指纹前缀保证不同内容同名文件互不覆盖）
    fn final_path(&self, fingerprint: &str, file_name: &str) -> PathBuf {
        let prefix = &fingerprint[..fingerprint.len().min(16)];
        self.root
            .join(FILE_DIR)
            .join(format!("{}_{}", prefix, file_name))
    }

    /// 把当前索引写回磁盘
    async fn persist_index(&self, snapshot: &HashMap<String, String>) -> Result<(), UploadError> {
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| UploadError::Structural(format!("序列化存储索引失败: {}", e)))?;
        fs::write(self.root.join(INDEX_FILE), content).await?;
        Ok(())
    }

    /// 扫描临时目录，列出已持有的分片索引
    async fn scan_uploaded_chunks(&self, fingerprint: &str) -> Result<Vec<usize>, UploadError> {
        let dir = self.chunk_dir(fingerprint);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut indices = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(PART_SUFFIX) {
                match stem.parse::<usize>() {
                    Ok(index) => indices.push(index),
                    Err(_) => warn!("临时区发现无法识别的分片文件: {:?}", entry.path()),
                }
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    async fn check(
        &self,
        fingerprint: &str,
        file_name: &str,
    ) -> Result<CheckResponse, UploadError> {
        // 命中持久索引：内容已存在，整体跳过
        if let Some(path) = self.index.read().await.get(fingerprint) {
            debug!("检查命中: fingerprint={}, path={}", fingerprint, path);
            return Ok(CheckResponse {
                exists: true,
                path: Some(path.clone()),
                uploaded_chunks: Vec::new(),
            });
        }

        // 未命中：报告临时区中已持有的分片，供续传
        let uploaded_chunks = self.scan_uploaded_chunks(fingerprint).await?;
        debug!(
            "检查未命中: fingerprint={}, file_name={}, 已持有分片数={}",
            fingerprint,
            file_name,
            uploaded_chunks.len()
        );

        Ok(CheckResponse {
            exists: false,
            path: None,
            uploaded_chunks,
        })
    }

    async fn upload_chunk(
        &self,
        fingerprint: &str,
        index: usize,
        _total_chunks: usize,
        data: Vec<u8>,
    ) -> Result<(), UploadError> {
        fs::create_dir_all(self.chunk_dir(fingerprint)).await?;

        // 整体覆盖写，重传同一分片是幂等的
        let path = self.chunk_path(fingerprint, index);
        let mut file = fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.flush().await?;

        debug!(
            "分片已落盘: fingerprint={}, index={}, size={}",
            fingerprint,
            index,
            data.len()
        );
        Ok(())
    }

    async fn merge(
        &self,
        fingerprint: &str,
        file_name: &str,
        total_chunks: usize,
    ) -> Result<MergeResponse, UploadError> {
        // 已经合并过：直接返回已有结果（所有分片就绪后重复调用是安全的）
        if let Some(path) = self.index.read().await.get(fingerprint) {
            return Ok(MergeResponse {
                success: true,
                path: Some(path.clone()),
            });
        }

        // 任一分片缺失则拒绝合并
        for index in 0..total_chunks {
            if !self.chunk_path(fingerprint, index).exists() {
                warn!(
                    "合并被拒绝: fingerprint={}, 缺少分片 #{} (共 {} 片)",
                    fingerprint, index, total_chunks
                );
                return Ok(MergeResponse {
                    success: false,
                    path: None,
                });
            }
        }

        // 按索引顺序拼接
        let final_path = self.final_path(fingerprint, file_name);
        let mut output = fs::File::create(&final_path).await?;
        for index in 0..total_chunks {
            let data = fs::read(self.chunk_path(fingerprint, index)).await?;
            output.write_all(&data).await?;
        }
        output.flush().await?;

        // 删除临时区
        let chunk_dir = self.chunk_dir(fingerprint);
        if chunk_dir.exists() {
            fs::remove_dir_all(&chunk_dir).await?;
        }

        // 记录持久索引
        let path_str = final_path.to_string_lossy().to_string();
        {
            let mut index_map = self.index.write().await;
            index_map.insert(fingerprint.to_string(), path_str.clone());
            self.persist_index(&index_map).await?;
        }

        info!(
            "合并完成: fingerprint={}, 分片数={}, path={}",
            fingerprint, total_chunks, path_str
        );

        Ok(MergeResponse {
            success: true,
            path: Some(path_str),
        })
    }
}
