//! 测试用的后端与传输层
//!
//! 上传地址格式为 `mock://{获取序号}/{分片序号}`，获取序号从 0 开始，
//! 因此可以从地址判断分片用的是初次获取还是某次刷新的结果。

use crate::uploader::backend::{
    CompleteRequest, PrepareRequest, PreparedUpload, TargetMap, UploadBackend, UploadTarget,
};
use crate::uploader::limiter::ChunkBody;
use crate::uploader::plan::TargetKind;
use crate::uploader::progress::ProgressCallback;
use crate::uploader::transport::{ChunkTransport, PutOutcome};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

/// 记录进度回调的值
pub fn progress_recorder() -> (ProgressCallback, Arc<Mutex<Vec<f64>>>) {
    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = values.clone();
    (Arc::new(move |p| sink.lock().push(p)), values)
}

fn is_cancelled(token: &Option<CancellationToken>) -> bool {
    token.as_ref().map_or(false, |t| t.is_cancelled())
}

#[derive(Default)]
pub struct MockBackend {
    chunk_size_hint: Option<u64>,
    /// 从第 n 次获取（从 0 开始）起全部失败
    fail_fetch_from: Option<usize>,
    /// 初次获取时不返回这些分片的地址
    omitted: HashSet<usize>,
    fail_prepare: bool,
    fail_complete: bool,
    cancel: Option<CancellationToken>,

    prepare_calls: AtomicUsize,
    fetches: Mutex<Vec<(usize, usize, TargetKind)>>,
    completes: Mutex<Vec<CompleteRequest>>,
    after_cancel: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size_hint(mut self, hint: u64) -> Self {
        self.chunk_size_hint = Some(hint);
        self
    }

    pub fn fail_fetch_after(mut self, n: usize) -> Self {
        self.fail_fetch_from = Some(n);
        self
    }

    pub fn omit_in_first_fetch(mut self, seq: usize) -> Self {
        self.omitted.insert(seq);
        self
    }

    pub fn fail_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn fail_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    /// 统计取消之后仍然发出的调用
    pub fn observe(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn prepare_calls(&self) -> usize {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_ranges(&self) -> Vec<(usize, usize, TargetKind)> {
        self.fetches.lock().clone()
    }

    pub fn complete_requests(&self) -> Vec<CompleteRequest> {
        self.completes.lock().clone()
    }

    pub fn calls_after_cancel(&self) -> usize {
        self.after_cancel.load(Ordering::SeqCst)
    }

    fn note_call(&self) {
        if is_cancelled(&self.cancel) {
            self.after_cancel.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl UploadBackend for MockBackend {
    async fn prepare_upload(&self, request: &PrepareRequest) -> Result<PreparedUpload> {
        self.note_call();
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_prepare {
            return Err(anyhow!("目标目录不可写: {}", request.destination));
        }
        Ok(PreparedUpload {
            session_id: format!("mock-{}", request.name),
            chunk_size_hint: self.chunk_size_hint,
        })
    }

    async fn fetch_upload_targets(
        &self,
        _session_id: &str,
        start_seq: usize,
        end_seq: usize,
        kind: TargetKind,
    ) -> Result<TargetMap> {
        self.note_call();
        let call = {
            let mut fetches = self.fetches.lock();
            fetches.push((start_seq, end_seq, kind));
            fetches.len() - 1
        };
        if self.fail_fetch_from.map_or(false, |n| call >= n) {
            return Err(anyhow!("获取上传地址失败: 第 {} 次调用", call));
        }

        Ok((start_seq..end_seq)
            .filter(|seq| call > 0 || !self.omitted.contains(seq))
            .map(|seq| (seq, UploadTarget::new(format!("mock://{}/{}", call, seq))))
            .collect())
    }

    async fn complete_upload(&self, request: &CompleteRequest) -> Result<()> {
        self.note_call();
        self.completes.lock().push(request.clone());
        if self.fail_complete {
            return Err(anyhow!("提交失败: 服务端返回 500"));
        }
        Ok(())
    }
}

/// 预设的单次响应，用完后默认成功
#[derive(Debug, Clone, Copy)]
pub enum PutScript {
    Status(u16),
    NetworkError,
}

struct PutCall {
    seq: usize,
    url: String,
    after_cancel: bool,
}

#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<usize, VecDeque<PutScript>>>,
    /// 每个分片的第一次尝试在此汇合
    first_attempt_barrier: Option<Arc<Barrier>>,
    cancel: Option<CancellationToken>,
    cancel_on: Option<usize>,

    calls: Mutex<Vec<PutCall>>,
    received: Mutex<BTreeMap<usize, Vec<u8>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_first_attempt_barrier(mut self, n: usize) -> Self {
        self.first_attempt_barrier = Some(Arc::new(Barrier::new(n)));
        self
    }

    pub fn observe(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// 收到该分片的请求时触发取消（请求本身成功）
    pub fn cancel_on(mut self, seq: usize) -> Self {
        self.cancel_on = Some(seq);
        self
    }

    pub fn script(&self, seq: usize, responses: Vec<PutScript>) {
        self.scripts
            .lock()
            .entry(seq)
            .or_default()
            .extend(responses);
    }

    pub fn attempts_for(&self, seq: usize) -> usize {
        self.calls.lock().iter().filter(|c| c.seq == seq).count()
    }

    pub fn urls_for(&self, seq: usize) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.seq == seq)
            .map(|c| c.url.clone())
            .collect()
    }

    pub fn total_attempts(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_after_cancel(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.after_cancel).count()
    }

    /// 成功上传的数据，按分片序号拼接
    pub fn received_bytes(&self) -> Vec<u8> {
        self.received.lock().values().flatten().copied().collect()
    }
}

#[async_trait]
impl ChunkTransport for MockTransport {
    async fn put_chunk(&self, target: &UploadTarget, mut body: ChunkBody) -> Result<PutOutcome> {
        let seq: usize = target
            .url
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("无法解析地址: {}", target.url))?;

        let first_attempt = {
            let mut calls = self.calls.lock();
            calls.push(PutCall {
                seq,
                url: target.url.clone(),
                after_cancel: is_cancelled(&self.cancel),
            });
            calls.iter().filter(|c| c.seq == seq).count() == 1
        };

        let mut data = Vec::with_capacity(body.len() as usize);
        while let Some(piece) = body.next().await {
            data.extend_from_slice(&piece?);
        }
        anyhow::ensure!(
            data.len() as u64 == body.len(),
            "请求体长度不一致: {} != {}",
            data.len(),
            body.len()
        );

        if first_attempt {
            if let Some(barrier) = &self.first_attempt_barrier {
                barrier.wait().await;
            }
        }
        if self.cancel_on == Some(seq) {
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
        }

        let script = self
            .scripts
            .lock()
            .get_mut(&seq)
            .and_then(|queue| queue.pop_front());
        match script {
            Some(PutScript::Status(status)) => Ok(PutOutcome::Status {
                status,
                body: "scripted failure".to_string(),
            }),
            Some(PutScript::NetworkError) => Err(anyhow!("connection reset by peer")),
            None => {
                self.received.lock().insert(seq, data);
                Ok(PutOutcome::Stored {
                    etag: Some(format!("etag-{}", seq)),
                })
            }
        }
    }
}
