//! 上传地址提供者
//!
//! 每个批次在派发分片前获取一次上传地址。分片收到"地址过期"响应后调用
//! [`TargetProvider::refresh_targets`]，同一批次的并发刷新请求被合并为一次网络调用：
//!
//! - 批次状态由异步互斥锁保护，刷新在锁内进行，只有锁内会修改地址表
//! - 每次刷新把批次的 `epoch` 加一；分片记录自己拿到地址时的 `epoch`
//! - 拿到锁时若 `epoch` 已前进且覆盖了本分片，直接复用结果（成功或同一个错误）
//!
//! 去重范围只覆盖刷新路径；初次获取发生在派发分片之前，不存在竞争。
//! 刷新按 [`BatchKey`] 在进行中的批次表里查找，不在表内的批次（已全部完成或属于其他会话）拒绝刷新。

use crate::error::UploadError;
use crate::uploader::backend::{TargetMap, UploadBackend, UploadTarget};
use crate::uploader::plan::{Batch, TargetKind};
use bit_set::BitSet;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 批次标识：(会话ID, 起始序号, 结束序号)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub session_id: String,
    pub start: usize,
    pub end: usize,
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {})", self.session_id, self.start, self.end)
    }
}

/// 分片拿到的上传地址及其所属代次
#[derive(Debug, Clone)]
pub struct TargetLease {
    pub target: Option<UploadTarget>,
    pub epoch: u64,
}

struct BatchState {
    epoch: u64,
    targets: TargetMap,
    /// 最近一次成功刷新覆盖的起始序号
    refreshed_from: usize,
    /// 最近一次刷新失败的错误，所有同代等待者共享
    last_error: Option<UploadError>,
}

/// 一个批次的上传地址表
pub struct BatchTargets {
    key: BatchKey,
    batch: Batch,
    state: tokio::sync::Mutex<BatchState>,
    completed: parking_lot::Mutex<BitSet>,
}

impl BatchTargets {
    fn new(key: BatchKey, batch: Batch, targets: TargetMap) -> Self {
        Self {
            key,
            batch,
            state: tokio::sync::Mutex::new(BatchState {
                epoch: 0,
                targets,
                refreshed_from: batch.start,
                last_error: None,
            }),
            completed: parking_lot::Mutex::new(BitSet::new()),
        }
    }

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    pub fn batch(&self) -> Batch {
        self.batch
    }

    /// 读取分片当前的上传地址
    pub async fn lease(&self, seq: usize) -> TargetLease {
        let state = self.state.lock().await;
        TargetLease {
            target: state.targets.get(&seq).cloned(),
            epoch: state.epoch,
        }
    }

    /// 批次内第一个未完成的分片
    pub fn first_pending(&self) -> Option<usize> {
        let completed = self.completed.lock();
        self.batch.seqs().find(|seq| !completed.contains(*seq))
    }
}

/// 单个上传会话的地址提供者
pub struct TargetProvider {
    backend: Arc<dyn UploadBackend>,
    session_id: String,
    kind: TargetKind,
    /// 进行中的批次，批次内分片全部完成后移除
    batches: DashMap<BatchKey, Arc<BatchTargets>>,
    fetch_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl TargetProvider {
    pub fn new(backend: Arc<dyn UploadBackend>, session_id: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            backend,
            session_id: session_id.into(),
            kind,
            batches: DashMap::new(),
            fetch_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    /// 获取批次的上传地址（初次获取）
    pub async fn fetch_targets(
        &self,
        cancel: &CancellationToken,
        batch: Batch,
    ) -> Result<Arc<BatchTargets>, UploadError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let targets = self.request(cancel, batch.start, batch.end).await?;

        let key = BatchKey {
            session_id: self.session_id.clone(),
            start: batch.start,
            end: batch.end,
        };
        debug!("[批次 {}] 获取到 {} 个上传地址", key, targets.len());

        let entry = Arc::new(BatchTargets::new(key.clone(), batch, targets));
        self.batches.insert(key, entry.clone());
        Ok(entry)
    }

    /// 刷新过期的上传地址（同批次并发请求合并为一次）
    ///
    /// # 参数
    /// * `key` - 分片所属批次
    /// * `failing_seq` - 收到过期响应的分片
    /// * `observed_epoch` - 该分片上传时使用的地址代次
    pub async fn refresh_targets(
        &self,
        cancel: &CancellationToken,
        key: &BatchKey,
        failing_seq: usize,
        observed_epoch: u64,
    ) -> Result<TargetLease, UploadError> {
        let batch = match self.batches.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                warn!("[分片#{}] 批次 {} 不在进行中，拒绝刷新", failing_seq, key);
                return Err(UploadError::TargetFetch {
                    start: key.start,
                    end: key.end,
                    message: format!("批次 {} 不在进行中", key),
                });
            }
        };
        let mut state = batch.state.lock().await;

        if state.epoch > observed_epoch {
            if let Some(err) = &state.last_error {
                return Err(err.clone());
            }
            if failing_seq >= state.refreshed_from {
                debug!(
                    "[分片#{}] 批次 {} 已被刷新 (epoch {} -> {})，直接复用",
                    failing_seq, batch.key, observed_epoch, state.epoch
                );
                return Ok(TargetLease {
                    target: state.targets.get(&failing_seq).cloned(),
                    epoch: state.epoch,
                });
            }
        }

        // 从批次内第一个未完成的分片开始刷新，覆盖所有可能同时过期的分片
        let from = batch
            .first_pending()
            .map_or(failing_seq, |first| first.min(failing_seq));
        let end = batch.batch.end;
        let calls = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "[分片#{}] 上传地址过期，刷新批次 {} 的 [{}, {}) (第 {} 次刷新)",
            failing_seq, batch.key, from, end, calls
        );

        let result = self.request(cancel, from, end).await;
        state.epoch += 1;

        match result {
            Ok(targets) => {
                state.targets.extend(targets);
                state.refreshed_from = from;
                state.last_error = None;
                info!("[批次 {}] 上传地址刷新成功 (epoch {})", batch.key, state.epoch);
                Ok(TargetLease {
                    target: state.targets.get(&failing_seq).cloned(),
                    epoch: state.epoch,
                })
            }
            Err(e) => {
                state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// 记录分片完成；批次内全部完成后从进行中列表移除
    pub fn complete_chunk(&self, batch: &BatchTargets, seq: usize) {
        batch.completed.lock().insert(seq);
        if batch.first_pending().is_none() {
            self.batches.remove(&batch.key);
            debug!("[批次 {}] 全部分片完成", batch.key);
        }
    }

    /// 进行中的批次数
    pub fn active_batches(&self) -> usize {
        self.batches.len()
    }

    /// 初次获取调用次数
    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// 刷新调用次数（真正发出的网络请求）
    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        cancel: &CancellationToken,
        start: usize,
        end: usize,
    ) -> Result<TargetMap, UploadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            r = self.backend.fetch_upload_targets(&self.session_id, start, end, self.kind) => {
                r.map_err(|e| UploadError::TargetFetch {
                    start,
                    end,
                    message: format!("{:#}", e),
                })
            }
        }
    }
}
