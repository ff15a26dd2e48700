//! 上传进度
//!
//! 进度 = floor + span × 已完成分片数 / 总分片数，提交成功后才报告 100。
//! 分片完成顺序任意，进度只依赖完成计数；上报在锁内进行，保证回调收到的序列单调不减。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 提交前能报告的最大进度
const MAX_BEFORE_FINISH: f64 = 99.0;

/// 进度回调，参数范围 [0, 100]
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// 分片进度跟踪
pub struct ProgressTracker {
    total_chunks: usize,
    floor: f64,
    span: f64,
    completed: AtomicUsize,
    uploaded_bytes: AtomicU64,
    /// 最近一次上报的值
    last_reported: Mutex<f64>,
    callback: Option<ProgressCallback>,
    started_at: Instant,
}

impl ProgressTracker {
    pub fn new(total_chunks: usize, floor: f64, span: f64, callback: Option<ProgressCallback>) -> Self {
        Self {
            total_chunks: total_chunks.max(1),
            floor,
            span,
            completed: AtomicUsize::new(0),
            uploaded_bytes: AtomicU64::new(0),
            last_reported: Mutex::new(0.0),
            callback,
            started_at: Instant::now(),
        }
    }

    /// 规划完成，开始上传
    pub fn start(&self) {
        self.report(self.floor);
    }

    /// 记录一个分片完成，返回新的完成数
    pub fn chunk_completed(&self, size: u64) -> usize {
        self.uploaded_bytes.fetch_add(size, Ordering::SeqCst);
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.report(self.percent_for(completed));
        completed
    }

    /// 提交成功
    pub fn finish(&self) {
        self.report(100.0);
    }

    pub fn percent_for(&self, completed: usize) -> f64 {
        let completed = completed.min(self.total_chunks);
        let percent = self.floor + self.span * (completed as f64 / self.total_chunks as f64);
        percent.min(MAX_BEFORE_FINISH)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    /// 平均上传速度 (bytes/s)
    pub fn average_speed(&self) -> u64 {
        let secs = self.started_at.elapsed().as_secs_f64();
        if secs > 0.0 {
            (self.uploaded_bytes() as f64 / secs) as u64
        } else {
            0
        }
    }

    fn report(&self, value: f64) {
        let value = value.clamp(0.0, 100.0);
        let mut last = self.last_reported.lock();
        if value < *last {
            return;
        }
        *last = value;
        if let Some(cb) = &self.callback {
            cb(value);
        }
    }
}
