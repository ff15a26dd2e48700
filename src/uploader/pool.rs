// 分片任务池
//
// - 使用 Semaphore 控制最大并发分片数，调度方先拿到许可再派发分片
// - 使用 JoinSet 管理并发任务
// - 只记录第一个致命错误；已派发的任务不会被强制终止，等待它们自行结束，
//   保证每个读取器都能归还
// - 任务在释放许可之前写入错误槽，调度方拿到许可后一定能看到此前的失败

use crate::error::UploadError;
use crate::uploader::backend::PartReceipt;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type ChunkResult = Result<PartReceipt, UploadError>;

/// 第一个致命错误，任务与调度方共享
#[derive(Clone, Default)]
struct FirstError(Arc<Mutex<Option<UploadError>>>);

impl FirstError {
    /// 记录错误，已有错误时返回 false
    fn record(&self, err: UploadError) -> bool {
        let mut slot = self.0.lock();
        if slot.is_some() {
            debug!("忽略后续错误: {}", err);
            return false;
        }
        error!("分片上传中止: {}", err);
        *slot = Some(err);
        true
    }

    fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    fn take(&self) -> Option<UploadError> {
        self.0.lock().take()
    }
}

/// 有界分片任务池
pub struct ChunkWorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    join_set: JoinSet<ChunkResult>,
    receipts: Vec<PartReceipt>,
    first_error: FirstError,
    dispatched: usize,
}

impl ChunkWorkerPool {
    /// # 参数
    /// * `size` - 最大并发数，调用方传入 min(分片数, 线程数)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            join_set: JoinSet::new(),
            receipts: Vec::new(),
            first_error: FirstError::default(),
            dispatched: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 已派发的任务数
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// 等待一个空闲槽位，等待期间响应取消
    pub async fn reserve(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, UploadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| UploadError::Cancelled)
            }
        }
    }

    /// 派发分片任务，任务结束时释放许可
    pub fn spawn<F>(&mut self, seq: usize, permit: OwnedSemaphorePermit, task: F)
    where
        F: Future<Output = ChunkResult> + Send + 'static,
    {
        self.dispatched += 1;
        let first_error = self.first_error.clone();
        self.join_set.spawn(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(UploadError::ChunkUpload {
                    seq,
                    attempts: 0,
                    message: "分片任务异常退出".to_string(),
                }),
            };
            if let Err(e) = &result {
                first_error.record(e.clone());
            }
            drop(permit);
            result
        });
    }

    /// 非阻塞地收集已结束的任务
    pub fn reap(&mut self) {
        while let Some(result) = self.join_set.try_join_next() {
            self.handle_result(result);
        }
    }

    /// 记录致命错误（只保留第一个）
    pub fn fail(&mut self, err: UploadError) {
        self.first_error.record(err);
    }

    /// 是否已有任务（或调度方）报告致命错误，不依赖任务结果是否已被收集
    pub fn has_failed(&self) -> bool {
        self.first_error.is_set()
    }

    /// 运行中的任务数
    pub fn in_flight(&self) -> usize {
        self.join_set.len()
    }

    /// 等待所有已派发的任务结束
    ///
    /// 全部成功时返回按序号排列的回执，否则返回第一个错误。
    pub async fn wait(mut self) -> Result<Vec<PartReceipt>, UploadError> {
        while let Some(result) = self.join_set.join_next().await {
            self.handle_result(result);
        }

        if let Some(err) = self.first_error.take() {
            return Err(err);
        }
        let mut receipts = self.receipts;
        receipts.sort_by_key(|r| r.seq);
        Ok(receipts)
    }

    fn handle_result(&mut self, result: Result<ChunkResult, JoinError>) {
        match result {
            Ok(Ok(receipt)) => self.receipts.push(receipt),
            // 任务内已写入错误槽
            Ok(Err(_)) => {}
            Err(e) => {
                // 只有任务被中止时才会走到这里
                error!("分片任务异常: {}", e);
                self.fail(UploadError::Cancelled);
            }
        }
    }
}
