// 重试执行器
//
// 把单个异步操作包上有界重试和指数退避：
// - 最多尝试 max_retries + 1 次
// - 两次尝试之间等待 min(base * 2^attempt, cap)，最后一次失败后不再等待
// - 每次尝试前检查取消；退避等待和执行中的请求都与取消令牌竞争
// - 取消与重试耗尽是两种不同的结果：取消立即返回，绝不重试

use crate::error::UploadError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 默认初始退避延迟（毫秒）
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// 默认最大退避延迟（毫秒）
pub const DEFAULT_MAX_DELAY_MS: u64 = 10000;

/// 重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大重试次数（总尝试次数 = max_retries + 1）
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大退避延迟（毫秒）
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// 计算第 attempt 次失败后的退避延迟
    ///
    /// # 延迟序列（默认参数）
    /// - attempt=0: 1000ms
    /// - attempt=1: 2000ms
    /// - attempt=2: 4000ms
    /// - 上限: 10000ms
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

/// 带重试地执行一个异步操作
///
/// `op` 每次调用产生一次新的尝试。可重试的错误按退避序列重试；
/// 取消、结构性失败和本地 IO 错误立即返回。
/// 重试耗尽时返回最后一次的底层错误
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, UploadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
{
    let mut last_error: Option<UploadError> = None;

    for attempt in 0..=policy.max_retries {
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        // 执行中的请求与取消竞争：取消时丢弃未完成的请求
        let result = tokio::select! {
            _ = token.cancelled() => return Err(UploadError::Cancelled),
            result = op() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
            Err(e) if !e.is_retriable() => return Err(e),
            Err(e) => {
                if attempt < policy.max_retries {
                    let delay_ms = policy.backoff_delay_ms(attempt);
                    warn!(
                        "操作失败，等待 {}ms 后重试 ({}/{}): {}",
                        delay_ms,
                        attempt + 1,
                        policy.max_retries,
                        e
                    );

                    tokio::select! {
                        _ = token.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| UploadError::Transient("重试次数已耗尽".to_string())))
}
