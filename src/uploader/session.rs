// 上传会话
//
// 一次文件上传对应一个会话，由上传调用独占，调用返回后即销毁：
//
//   Planning → TargetsFetching → Uploading → AllChunksComplete → Finalizing → Done
//
// TargetsFetching / Uploading / Finalizing 阶段遇到不可重试错误或取消时进入 Failed，
// Failed 为终态，不会自动恢复，调用方需要重新发起整个会话。
//
// 多批次会话在 TargetsFetching 与 Uploading 之间交替：每个批次先获取地址，再派发分片。

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::uploader::backend::{CompleteRequest, PartReceipt, PrepareRequest, UploadBackend};
use crate::uploader::limiter::UploadRateLimiter;
use crate::uploader::plan::UploadPlan;
use crate::uploader::pool::ChunkWorkerPool;
use crate::uploader::progress::{ProgressCallback, ProgressTracker};
use crate::uploader::section::{SectionReaderPool, UploadSource};
use crate::uploader::target::TargetProvider;
use crate::uploader::transport::{ChunkTransport, HttpChunkTransport};
use crate::uploader::worker::{self, ChunkContext, ChunkJob, RetryPolicy};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Planning,
    TargetsFetching,
    Uploading,
    AllChunksComplete,
    Finalizing,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Planning => "规划中",
            SessionState::TargetsFetching => "获取上传地址",
            SessionState::Uploading => "上传中",
            SessionState::AllChunksComplete => "分片已全部上传",
            SessionState::Finalizing => "提交中",
            SessionState::Done => "已完成",
            SessionState::Failed => "失败",
        };
        f.write_str(name)
    }
}

/// 上传成功的回执
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub session_id: String,
    pub total_size: u64,
    pub chunk_count: usize,
    /// 按序号排列
    pub parts: Vec<PartReceipt>,
    /// 地址刷新次数（实际发出的请求数）
    pub refreshes: usize,
    pub elapsed: Duration,
}

/// 会话运行统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// 初次获取地址的次数
    pub target_fetches: usize,
    pub refreshes: usize,
    pub readers_acquired: usize,
    pub readers_recycled: usize,
    /// 会话结束时仍未归还的读取器
    pub readers_outstanding: usize,
}

/// 上传会话
pub struct UploadSession {
    /// 本地任务 ID（仅用于日志关联）
    task_id: String,
    session_id: String,
    name: String,
    plan: UploadPlan,
    state: Mutex<SessionState>,
    stats: Mutex<SessionStats>,
    backend: Arc<dyn UploadBackend>,
    transport: Arc<dyn ChunkTransport>,
    limiter: UploadRateLimiter,
    config: UploadConfig,
}

impl UploadSession {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn total_size(&self) -> u64 {
        self.plan.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.plan.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.plan.chunk_count
    }

    pub fn last_chunk_size(&self) -> u64 {
        self.plan.last_chunk_size
    }

    pub fn batch_size(&self) -> usize {
        self.plan.batch_size
    }

    pub fn plan(&self) -> &UploadPlan {
        &self.plan
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        info!("[会话 {}] 状态: {} -> {}", self.session_id, *state, next);
        *state = next;
    }

    /// 上传所有分片并提交
    ///
    /// # 参数
    /// * `source` - 源数据，大小必须与规划一致
    /// * `progress` - 进度回调，成功时最后一次回调为 100
    /// * `cancel` - 取消令牌，覆盖整个会话
    pub async fn run(
        &self,
        source: UploadSource,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        if self.state() != SessionState::Planning {
            return Err(UploadError::Planning(format!(
                "会话已运行过，当前状态: {}",
                self.state()
            )));
        }

        let started = Instant::now();
        let result = self.run_inner(source, progress, cancel, started).await;

        if let Err(e) = &result {
            self.transition(SessionState::Failed);
            if e.is_cancelled() {
                warn!("[会话 {}] 上传已取消: {}", self.session_id, self.name);
            } else {
                error!("[会话 {}] 上传失败: {}", self.session_id, e);
            }
        }
        result
    }

    async fn run_inner(
        &self,
        source: UploadSource,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<UploadReceipt, UploadError> {
        let plan = &self.plan;
        if source.size() != plan.total_size {
            return Err(UploadError::Planning(format!(
                "源数据大小 {} 与规划大小 {} 不一致",
                source.size(),
                plan.total_size
            )));
        }

        let threads = plan.chunk_count.min(self.config.effective_threads());
        let readers = Arc::new(SectionReaderPool::new(source, threads));
        let tracker = Arc::new(ProgressTracker::new(
            plan.chunk_count,
            self.config.progress_floor,
            self.config.progress_span,
            progress,
        ));
        let provider = Arc::new(TargetProvider::new(
            self.backend.clone(),
            self.session_id.clone(),
            plan.target_kind(),
        ));
        let ctx = Arc::new(ChunkContext {
            provider: provider.clone(),
            transport: self.transport.clone(),
            limiter: self.limiter.clone(),
            readers: readers.clone(),
            progress: tracker.clone(),
            retry: RetryPolicy::from_config(&self.config),
            expired_status: self.config.expired_status,
            cancel: cancel.clone(),
        });

        info!(
            "[会话 {}] 开始上传 {}: {} 个分片, 并发数: {}, 限速: {:?}",
            self.session_id,
            self.name,
            plan.chunk_count,
            threads,
            self.limiter.bytes_per_sec()
        );
        tracker.start();

        let mut pool = ChunkWorkerPool::new(threads);
        self.dispatch(&mut pool, &ctx, &readers, cancel).await;
        let result = pool.wait().await;

        *self.stats.lock() = {
            let (acquired, recycled) = readers.stats();
            SessionStats {
                target_fetches: provider.fetch_count(),
                refreshes: provider.refresh_count(),
                readers_acquired: acquired,
                readers_recycled: recycled,
                readers_outstanding: readers.outstanding(),
            }
        };

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let parts = result?;
        self.transition(SessionState::AllChunksComplete);
        debug!(
            "[会话 {}] 所有 {} 个分片上传完成, 平均速度: {} KB/s",
            self.session_id,
            parts.len(),
            tracker.average_speed() / 1024
        );

        self.finalize(&parts, cancel).await?;
        tracker.finish();
        self.transition(SessionState::Done);

        let elapsed = started.elapsed();
        info!(
            "[会话 {}] ✓ 上传完成: {} ({} bytes, 耗时 {:.1}s, 刷新 {} 次)",
            self.session_id,
            self.name,
            plan.total_size,
            elapsed.as_secs_f64(),
            provider.refresh_count()
        );

        Ok(UploadReceipt {
            session_id: self.session_id.clone(),
            total_size: plan.total_size,
            chunk_count: plan.chunk_count,
            parts,
            refreshes: provider.refresh_count(),
            elapsed,
        })
    }

    /// 按批次派发分片，遇到取消或错误时停止派发
    async fn dispatch(
        &self,
        pool: &mut ChunkWorkerPool,
        ctx: &Arc<ChunkContext>,
        readers: &SectionReaderPool,
        cancel: &CancellationToken,
    ) {
        for batch in self.plan.batches() {
            if cancel.is_cancelled() {
                pool.fail(UploadError::Cancelled);
                return;
            }
            pool.reap();
            if pool.has_failed() {
                return;
            }

            self.transition(SessionState::TargetsFetching);
            let targets = match ctx.provider.fetch_targets(cancel, batch).await {
                Ok(targets) => targets,
                Err(e) => {
                    pool.fail(e);
                    return;
                }
            };
            self.transition(SessionState::Uploading);

            for seq in batch.seqs() {
                let permit = match pool.reserve(cancel).await {
                    Ok(permit) => permit,
                    Err(e) => {
                        pool.fail(e);
                        return;
                    }
                };
                pool.reap();
                if pool.has_failed() {
                    return;
                }
                if cancel.is_cancelled() {
                    pool.fail(UploadError::Cancelled);
                    return;
                }

                let Some(chunk) = self.plan.chunk(seq).copied() else {
                    pool.fail(UploadError::Planning(format!("分片 #{} 不在规划中", seq)));
                    return;
                };
                // 按序号顺序借出读取器，一次性流因此只会被顺序读取
                let reader = match readers
                    .get_section_reader(seq, chunk.offset, chunk.size)
                    .await
                {
                    Ok(reader) => reader,
                    Err(e) => {
                        pool.fail(e);
                        return;
                    }
                };

                let job = ChunkJob {
                    chunk,
                    batch: targets.clone(),
                    reader,
                };
                pool.spawn(seq, permit, worker::upload_chunk(ctx.clone(), job));
            }
        }
        debug!(
            "[会话 {}] 已派发 {} 个分片，等待剩余任务结束",
            self.session_id,
            pool.dispatched()
        );
    }

    /// 提交上传
    async fn finalize(&self, parts: &[PartReceipt], cancel: &CancellationToken) -> Result<(), UploadError> {
        self.transition(SessionState::Finalizing);
        let request = CompleteRequest {
            session_id: self.session_id.clone(),
            total_size: self.plan.total_size,
            is_multipart: self.plan.is_multipart(),
            parts: parts.to_vec(),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            r = self.backend.complete_upload(&request) => {
                r.map_err(|e| UploadError::Finalize(format!("{:#}", e)))
            }
        }
    }
}

/// 分片上传器
///
/// 持有后端、传输层和总限速器；限速器在所有会话之间共享，其余状态均属于单个会话。
#[derive(Clone)]
pub struct ChunkedUploader {
    backend: Arc<dyn UploadBackend>,
    transport: Arc<dyn ChunkTransport>,
    limiter: UploadRateLimiter,
    config: UploadConfig,
}

impl ChunkedUploader {
    pub fn new(
        backend: Arc<dyn UploadBackend>,
        transport: Arc<dyn ChunkTransport>,
        config: UploadConfig,
    ) -> Self {
        let limiter = UploadRateLimiter::new(config.rate_limit_bytes_per_sec());
        Self {
            backend,
            transport,
            limiter,
            config,
        }
    }

    /// 使用 reqwest 传输层
    pub fn with_http(backend: Arc<dyn UploadBackend>, config: UploadConfig) -> anyhow::Result<Self> {
        let transport = Arc::new(HttpChunkTransport::new(&config)?);
        Ok(Self::new(backend, transport, config))
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 预上传并规划分片
    ///
    /// 参数非法时在发出任何网络请求之前返回 `Planning` 错误。
    pub async fn prepare(
        &self,
        name: impl Into<String>,
        destination: impl Into<String>,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, UploadError> {
        let name = name.into();
        self.config
            .validate()
            .map_err(|e| UploadError::Planning(format!("{:#}", e)))?;
        let max_chunk_size = self.config.max_chunk_size();
        UploadPlan::new(size, max_chunk_size, self.config.batch_size)?;

        let request = PrepareRequest {
            name: name.clone(),
            size,
            destination: destination.into(),
        };
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            r = self.backend.prepare_upload(&request) => {
                r.map_err(|e| UploadError::Prepare(format!("{:#}", e)))?
            }
        };

        let effective_chunk_size = match prepared.chunk_size_hint {
            Some(hint) if hint > 0 => hint.min(max_chunk_size),
            _ => max_chunk_size,
        };
        let plan = UploadPlan::new(size, effective_chunk_size, self.config.batch_size)?;

        let session = UploadSession {
            task_id: Uuid::new_v4().to_string(),
            session_id: prepared.session_id,
            name,
            plan,
            state: Mutex::new(SessionState::Planning),
            stats: Mutex::new(SessionStats::default()),
            backend: self.backend.clone(),
            transport: self.transport.clone(),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
        };
        info!(
            "[会话 {}] 预上传成功: 任务={}, 文件={}, 大小={} bytes, 分片大小={} bytes, 分片数={}, 批次宽度={}",
            session.session_id,
            session.task_id,
            session.name,
            size,
            session.chunk_size(),
            session.chunk_count(),
            session.batch_size()
        );
        Ok(session)
    }

    /// 完整上传一个文件：预上传、分片上传、提交
    pub async fn upload(
        &self,
        name: impl Into<String>,
        destination: impl Into<String>,
        source: UploadSource,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        let session = self
            .prepare(name, destination, source.size(), cancel)
            .await?;
        session.run(source, progress, cancel).await
    }
}
