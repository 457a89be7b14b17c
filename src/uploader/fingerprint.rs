// 内容指纹计算
//
// 秒传与续传都以内容指纹为键：内容相同的文件必然得到相同指纹。
// 首选在阻塞线程池中流式计算 SHA-256，按分片大小的窗口读取以限制内存占用；
// 线程池不可用时降级为在当前上下文同步计算。降级路径使用同一个函数，
// 结果仍然只由文件内容决定（指纹若掺入时间戳等易变量，秒传契约即被破坏）

use crate::error::UploadError;
use crate::uploader::chunk::{clamp_chunk_size, MIN_CHUNK_SIZE};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// 文件内容指纹
#[derive(Debug, Clone)]
pub struct FileFingerprint {
    /// SHA-256 十六进制摘要
    pub digest: String,
    /// 文件大小
    pub file_size: u64,
}

/// 指纹计算器
pub struct Fingerprinter;

impl Fingerprinter {
    /// 计算文件的内容指纹
    ///
    /// # 参数
    /// * `path` - 本地文件路径
    /// * `window_size` - 读取窗口大小（通常取分片大小）
    pub async fn compute(path: &Path, window_size: u64) -> Result<FileFingerprint, UploadError> {
        let owned_path = path.to_path_buf();

        match tokio::task::spawn_blocking(move || Self::compute_sync(&owned_path, window_size))
            .await
        {
            Ok(result) => result,
            Err(join_err) => {
                // 阻塞线程池不可用不是致命错误，降级为同步计算。
                // 两条路径是同一个函数，指纹不受执行位置影响
                warn!("指纹计算线程池不可用，降级为同步计算: {}", join_err);
                Self::compute_sync(path, window_size)
            }
        }
    }

    /// 同步流式计算指纹（内部方法，首选路径和降级路径共用）
    fn compute_sync(path: &Path, window_size: u64) -> Result<FileFingerprint, UploadError> {
        let file = std::fs::File::open(path)?;
        let metadata = file.metadata()?;
        let file_size = metadata.len();

        // 按窗口大小读取，避免把整个文件拉进内存
        let window = clamp_chunk_size(window_size).min(file_size.max(MIN_CHUNK_SIZE)) as usize;
        let mut reader = std::io::BufReader::with_capacity(window, file);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; window];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        let digest = hex::encode(hasher.finalize());

        debug!(
            "指纹计算完成: path={:?}, size={}, digest={}",
            path, file_size, digest
        );

        Ok(FileFingerprint { digest, file_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(content: &[u8]) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[tokio::test]
    async fn test_identical_content_identical_digest() {
        let content = vec![0xABu8; 600 * 1024];
        let file1 = write_temp(&content);
        let file2 = write_temp(&content);

        let fp1 = Fingerprinter::compute(file1.path(), 4 * 1024 * 1024)
            .await
            .unwrap();
        let fp2 = Fingerprinter::compute(file2.path(), 4 * 1024 * 1024)
            .await
            .unwrap();

        assert_eq!(fp1.digest, fp2.digest);
        assert_eq!(fp1.file_size, 600 * 1024);
    }

    #[tokio::test]
    async fn test_different_content_different_digest() {
        let file1 = write_temp(b"content A");
        let file2 = write_temp(b"content B");

        let fp1 = Fingerprinter::compute(file1.path(), 4 * 1024 * 1024)
            .await
            .unwrap();
        let fp2 = Fingerprinter::compute(file2.path(), 4 * 1024 * 1024)
            .await
            .unwrap();

        assert_ne!(fp1.digest, fp2.digest);
    }

    #[tokio::test]
    async fn test_window_size_does_not_affect_digest() {
        // 指纹只由内容决定，窗口大小只影响内存占用
        let content: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let file = write_temp(&content);

        let fp_small = Fingerprinter::compute(file.path(), MIN_CHUNK_SIZE).await.unwrap();
        let fp_large = Fingerprinter::compute(file.path(), 32 * 1024 * 1024)
            .await
            .unwrap();

        assert_eq!(fp_small.digest, fp_large.digest);
    }

    #[tokio::test]
    async fn test_digest_matches_whole_file_sha256() {
        let content = b"hello fingerprint";
        let file = write_temp(content);

        let fp = Fingerprinter::compute(file.path(), 4 * 1024 * 1024)
            .await
            .unwrap();

        let mut hasher = Sha256::new();
        hasher.update(content);
        assert_eq!(fp.digest, hex::encode(hasher.finalize()));
    }

    #[tokio::test]
    async fn test_empty_file_fingerprint() {
        let file = write_temp(b"");
        let fp = Fingerprinter::compute(file.path(), 4 * 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(fp.file_size, 0);
        // 空内容的 SHA-256 是固定值
        assert_eq!(
            fp.digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_nonexistent_file_errors() {
        let result = Fingerprinter::compute(Path::new("/nonexistent/file.bin"), 4 * 1024 * 1024).await;
        assert!(matches!(result, Err(UploadError::Io(_))));
    }
}
