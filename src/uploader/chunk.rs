// 上传分片划分
//
// 分片规则：
// - 按固定分片大小切分，最后一个分片可以不满
// - 分片索引从 0 开始连续编号，创建后不再变化
// - 空文件没有分片，检查后直接进入合并阶段

use crate::error::UploadError;
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 默认分片大小: 4MB
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 最小分片大小: 256KB
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// 最大分片大小: 32MB
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// 把分片大小限制到有效范围内
pub fn clamp_chunk_size(chunk_size: u64) -> u64 {
    chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// 上传分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 从本地文件读取分片数据
    pub async fn read_data(&self, file_path: &Path) -> Result<Vec<u8>, UploadError> {
        let mut file = File::open(file_path).await?;
        file.seek(std::io::SeekFrom::Start(self.range.start)).await?;

        let mut buffer = vec![0u8; self.size() as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.index,
            self.range.start,
            self.range.end.saturating_sub(1),
            buffer.len()
        );

        Ok(buffer)
    }
}

/// 按固定分片大小划分整个文件
///
/// 返回的分片索引连续、范围首尾相接、整体恰好覆盖 [0, total_size)
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
    assert!(chunk_size > 0, "分片大小必须大于 0");

    let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset + chunk_size, total_size);
        chunks.push(UploadChunk::new(index, offset..end));
        offset = end;
        index += 1;
    }

    chunks
}

/// 取出服务端尚未持有的分片（续传时使用）
pub fn pending_chunks(
    plan: Vec<UploadChunk>,
    uploaded: &std::collections::BTreeSet<usize>,
) -> Vec<UploadChunk> {
    plan.into_iter()
        .filter(|c| !uploaded.contains(&c.index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_plan_exact_chunks() {
        // 整除：16MB / 4MB = 4 个分片
        let chunks = plan_chunks(16 * 1024 * 1024, 4 * 1024 * 1024);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].range, 0..(4 * 1024 * 1024));
        assert_eq!(chunks[3].range, (12 * 1024 * 1024)..(16 * 1024 * 1024));
    }

    #[test]
    fn test_plan_trailing_partial_chunk() {
        // 不整除：17MB / 4MB = 5 个分片，最后一个 1MB
        let chunks = plan_chunks(17 * 1024 * 1024, 4 * 1024 * 1024);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4].range, (16 * 1024 * 1024)..(17 * 1024 * 1024));
        assert_eq!(chunks[4].size(), 1024 * 1024);
    }

    #[test]
    fn test_plan_small_file_single_chunk() {
        let chunks = plan_chunks(2 * 1024 * 1024, 4 * 1024 * 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range, 0..(2 * 1024 * 1024));
    }

    #[test]
    fn test_plan_empty_file() {
        let chunks = plan_chunks(0, 4 * 1024 * 1024);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_clamp_chunk_size() {
        assert_eq!(clamp_chunk_size(1), MIN_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(DEFAULT_CHUNK_SIZE), DEFAULT_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(1024 * 1024 * 1024), MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_pending_chunks_filters_uploaded() {
        let plan = plan_chunks(3 * 1024, 1024);
        let uploaded: BTreeSet<usize> = [0, 1].into_iter().collect();

        let pending = pending_chunks(plan, &uploaded);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].index, 2);
    }

    #[tokio::test]
    async fn test_read_data_extracts_byte_range() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..=255u8).collect();
        temp_file.write_all(&content).unwrap();
        temp_file.flush().unwrap();

        let chunk = UploadChunk::new(1, 100..200);
        let data = chunk.read_data(temp_file.path()).await.unwrap();
        assert_eq!(data, &content[100..200]);
    }

    #[tokio::test]
    async fn test_read_data_missing_file() {
        let chunk = UploadChunk::new(0, 0..10);
        let result = chunk.read_data(Path::new("/nonexistent/file.bin")).await;
        assert!(matches!(result, Err(UploadError::Io(_))));
    }

    proptest! {
        // 任意文件大小下，分片划分必须无缝且恰好覆盖整个文件
        #[test]
        fn prop_plan_covers_file_without_gaps(
            total_size in 0u64..64 * 1024 * 1024,
            chunk_size in 4096u64..8 * 1024 * 1024,
        ) {
            let chunks = plan_chunks(total_size, chunk_size);

            prop_assert_eq!(chunks.len() as u64, total_size.div_ceil(chunk_size));

            let mut expected_start = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.range.start, expected_start);
                prop_assert!(chunk.size() <= chunk_size);
                prop_assert!(chunk.size() > 0);
                expected_start = chunk.range.end;
            }
            prop_assert_eq!(expected_start, total_size);
        }
    }
}
