//! 上传错误定义
//!
//! 会话级错误统一使用 `UploadError`，协作方（后端接口、分片传输）返回 `anyhow::Result`，
//! 由引擎在边界处转换为对应的错误类别。

use thiserror::Error;

/// 上传会话错误
///
/// 所有变体只携带渲染后的消息，因此可以 `Clone`：
/// 同一批次的去重刷新失败时，所有等待者拿到的是同一个错误。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 参数非法（文件大小、分片上限），未发出任何网络请求
    #[error("分片规划失败: {0}")]
    Planning(String),

    /// 预上传（会话协商）失败
    #[error("预上传失败: {0}")]
    Prepare(String),

    /// 批次上传地址获取失败
    #[error("获取上传地址失败 [{start}, {end}): {message}")]
    TargetFetch {
        start: usize,
        end: usize,
        message: String,
    },

    /// 上传地址已过期（内部信号，刷新成功后不会向外传播）
    #[error("分片 #{seq} 上传地址已过期")]
    TargetExpired { seq: usize },

    /// 分片耗尽重试次数
    #[error("分片 #{seq} 上传失败（已尝试 {attempts} 次）: {message}")]
    ChunkUpload {
        seq: usize,
        attempts: u32,
        message: String,
    },

    /// 读取源数据失败
    #[error("读取分片 #{seq} 源数据失败: {message}")]
    SourceRead { seq: usize, message: String },

    /// 所有分片已上传，但提交失败：数据可能已在远端，会话不算成功
    #[error("提交上传失败（分片已全部上传）: {0}")]
    Finalize(String),

    /// 上传已取消
    #[error("上传已取消")]
    Cancelled,
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// 是否为提交阶段失败（调用方不能把它当作普通失败忽略）
    pub fn is_finalize(&self) -> bool {
        matches!(self, UploadError::Finalize(_))
    }

    /// 是否会终止整个会话
    pub fn is_fatal(&self) -> bool {
        !matches!(self, UploadError::TargetExpired { .. })
    }
}

/// 单次分片尝试的失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误 5xx（可重试）
    ServerError,
    /// 限流 429（可重试）
    RateLimited,
    /// 上传地址过期（刷新后可重试）
    Expired,
    /// 批次响应里缺少该分片的上传地址（可重试，下一次尝试前刷新）
    MissingTarget,
    /// 其他非成功响应（不可重试）
    Rejected,
    /// 已取消（不可重试）
    Cancelled,
}

impl ChunkErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ChunkErrorKind::Network
                | ChunkErrorKind::Timeout
                | ChunkErrorKind::ServerError
                | ChunkErrorKind::RateLimited
                | ChunkErrorKind::Expired
                | ChunkErrorKind::MissingTarget
        )
    }

    /// 按 HTTP 状态码分类
    pub fn from_status(status: u16, expired_status: u16) -> Self {
        match status {
            s if s == expired_status => ChunkErrorKind::Expired,
            429 => ChunkErrorKind::RateLimited,
            408 => ChunkErrorKind::Timeout,
            500..=599 => ChunkErrorKind::ServerError,
            _ => ChunkErrorKind::Rejected,
        }
    }

    /// 按传输层错误信息分类
    pub fn from_transport_error(error: &anyhow::Error) -> Self {
        let error_str = format!("{:#}", error).to_lowercase();

        if error_str.contains("timeout") || error_str.contains("timed out") {
            ChunkErrorKind::Timeout
        } else if error_str.contains("cancel") {
            ChunkErrorKind::Cancelled
        } else {
            // 连接被重置、DNS 失败、body 读取中断等都按网络错误处理
            ChunkErrorKind::Network
        }
    }
}
