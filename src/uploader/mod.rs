// 分片上传引擎
//
// - 分片规划：按大小上限切分，单分片走单片授权，多分片按批次获取预签名地址
// - 有界并发：Semaphore + JoinSet，第一个致命错误生效，已派发的分片自然结束
// - 地址过期：同批次并发刷新合并为一次请求
// - 指数退避重试，全程响应取消
// - 总吞吐限速（令牌桶，所有 worker 共享）

pub mod backend;
pub mod limiter;
pub mod plan;
pub mod pool;
pub mod progress;
pub mod section;
pub mod session;
pub mod target;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    CompleteRequest, PartReceipt, PrepareRequest, PreparedUpload, TargetMap, UploadBackend,
    UploadTarget,
};
pub use limiter::{ChunkBody, UploadRateLimiter};
pub use plan::{Batch, Chunk, TargetKind, UploadPlan, DEFAULT_BATCH_SIZE};
pub use pool::ChunkWorkerPool;
pub use progress::{ProgressCallback, ProgressTracker};
pub use section::{SectionReader, SectionReaderPool, UploadSource};
pub use session::{ChunkedUploader, SessionState, SessionStats, UploadReceipt, UploadSession};
pub use target::{BatchKey, BatchTargets, TargetLease, TargetProvider};
pub use transport::{ChunkTransport, HttpChunkTransport, PutOutcome};
pub use worker::RetryPolicy;
