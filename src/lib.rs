// Netdisk Chunk Uploader
// 网盘分片上传核心库

// 配置管理模块
pub mod config;

// 错误定义
pub mod error;

// 日志模块
pub mod logging;

// 分片上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, LogConfig, UploadConfig};
pub use error::{ChunkErrorKind, UploadError};
pub use logging::{init_logging, LogGuard};
pub use uploader::{
    ChunkTransport, ChunkedUploader, CompleteRequest, HttpChunkTransport, PartReceipt,
    PrepareRequest, PreparedUpload, ProgressCallback, SessionState, UploadBackend, UploadReceipt,
    UploadSession, UploadSource, UploadTarget,
};
