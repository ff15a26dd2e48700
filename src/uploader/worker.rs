// 单个分片的上传任务
//
// 一个任务独占一个分片的读取器，覆盖该分片的全部尝试：
// - 每次尝试前把读取器定位到窗口起点，经限速器包装后 PUT 到当前上传地址
// - 地址过期（或批次响应缺少地址）时走去重刷新，拿到新地址后立即重试
// - 其余可重试错误按指数退避等待，等待期间响应取消
// - 不可重试错误或耗尽尝试次数时返回 ChunkUpload 错误
// 无论结果如何，读取器都会归还到读取池。

use crate::config::UploadConfig;
use crate::error::{ChunkErrorKind, UploadError};
use crate::uploader::backend::PartReceipt;
use crate::uploader::limiter::UploadRateLimiter;
use crate::uploader::plan::Chunk;
use crate::uploader::progress::ProgressTracker;
use crate::uploader::section::{SectionReader, SectionReaderPool};
use crate::uploader::target::{BatchTargets, TargetProvider};
use crate::uploader::transport::{ChunkTransport, PutOutcome};
use std::io::{Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 每个分片的最大尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// 第 `attempt` 次尝试失败后的等待时间
    ///
    /// # 延迟序列（initial=1s, max=10s）
    /// - attempt=1: 1s
    /// - attempt=2: 2s
    /// - attempt=3: 4s
    /// - 限流时直接等待最大值
    pub fn backoff_delay(&self, attempt: u32, kind: ChunkErrorKind) -> Duration {
        if kind == ChunkErrorKind::RateLimited {
            return self.max_backoff;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

/// 同一会话内所有分片任务共享的上下文
pub struct ChunkContext {
    pub provider: Arc<TargetProvider>,
    pub transport: Arc<dyn ChunkTransport>,
    pub limiter: UploadRateLimiter,
    pub readers: Arc<SectionReaderPool>,
    pub progress: Arc<ProgressTracker>,
    pub retry: RetryPolicy,
    /// 表示地址过期的状态码
    pub expired_status: u16,
    pub cancel: CancellationToken,
}

/// 一个分片任务的描述（每个任务独立持有）
pub struct ChunkJob {
    pub chunk: Chunk,
    pub batch: Arc<BatchTargets>,
    pub reader: SectionReader,
}

/// 执行分片上传任务
///
/// 成功时返回分片回执，且只会计入一次完成进度。
pub async fn upload_chunk(ctx: Arc<ChunkContext>, job: ChunkJob) -> Result<PartReceipt, UploadError> {
    let ChunkJob {
        chunk,
        batch,
        mut reader,
    } = job;

    debug!(
        "[分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes)",
        chunk.seq,
        chunk.offset,
        chunk.offset + chunk.size - 1,
        chunk.size
    );

    let started = Instant::now();
    let result = run_attempts(&ctx, &batch, &chunk, &mut reader).await;
    ctx.readers.recycle_section_reader(reader);

    let etag = result?;
    ctx.provider.complete_chunk(&batch, chunk.seq);
    let completed = ctx.progress.chunk_completed(chunk.size);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let speed = if elapsed_ms > 0 {
        chunk.size * 1000 / elapsed_ms
    } else {
        0
    };
    info!(
        "[分片#{}] ✓ 上传成功 (已完成 {} 个, 速度: {} KB/s)",
        chunk.seq,
        completed,
        speed / 1024
    );

    Ok(PartReceipt {
        seq: chunk.seq,
        size: chunk.size,
        etag,
    })
}

/// 尝试循环，成功时返回 ETag
async fn run_attempts(
    ctx: &ChunkContext,
    batch: &BatchTargets,
    chunk: &Chunk,
    reader: &mut SectionReader,
) -> Result<Option<String>, UploadError> {
    let seq = chunk.seq;
    let max_attempts = ctx.retry.max_attempts;
    let mut lease = batch.lease(seq).await;
    let mut last_message = String::new();

    for attempt in 1..=max_attempts {
        if ctx.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let (kind, message) = match lease.target.clone() {
            None => (
                ChunkErrorKind::MissingTarget,
                format!("批次响应中缺少分片 #{} 的上传地址", seq),
            ),
            Some(target) => {
                reader
                    .seek(SeekFrom::Start(0))
                    .map_err(|e| UploadError::SourceRead {
                        seq,
                        message: e.to_string(),
                    })?;
                let body = ctx.limiter.limited_body(reader.remaining(), ctx.cancel.clone());

                debug!(
                    "[分片#{}] 第 {}/{} 次尝试 (地址代次: {})",
                    seq, attempt, max_attempts, lease.epoch
                );

                // 已发出的请求允许跑完，取消通过请求体中断
                match ctx.transport.put_chunk(&target, body).await {
                    Ok(PutOutcome::Stored { etag }) => return Ok(etag),
                    Ok(PutOutcome::Status { status, body }) => (
                        ChunkErrorKind::from_status(status, ctx.expired_status),
                        format!("HTTP {}: {}", status, body),
                    ),
                    Err(e) => (ChunkErrorKind::from_transport_error(&e), format!("{:#}", e)),
                }
            }
        };

        if ctx.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        if !kind.is_retriable() {
            error!(
                "[分片#{}] 上传失败（不可重试）: {:?}, 错误: {}",
                seq, kind, message
            );
            return Err(UploadError::ChunkUpload {
                seq,
                attempts: attempt,
                message,
            });
        }
        last_message = message;

        if attempt == max_attempts {
            break;
        }

        match kind {
            ChunkErrorKind::Expired | ChunkErrorKind::MissingTarget => {
                lease = match ctx
                    .provider
                    .refresh_targets(&ctx.cancel, batch.key(), seq, lease.epoch)
                    .await
                {
                    Ok(lease) => lease,
                    Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
                    Err(e) => {
                        error!("[分片#{}] 刷新上传地址失败: {}", seq, e);
                        return Err(UploadError::ChunkUpload {
                            seq,
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                };
            }
            _ => {
                let delay = ctx.retry.backoff_delay(attempt, kind);
                warn!(
                    "[分片#{}] 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                    seq,
                    delay.as_millis(),
                    attempt,
                    max_attempts,
                    last_message
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(UploadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    error!(
        "[分片#{}] 上传失败，已达最大尝试次数 ({}): {}",
        seq, max_attempts, last_message
    );
    Err(UploadError::ChunkUpload {
        seq,
        attempts: max_attempts,
        message: last_message,
    })
}
