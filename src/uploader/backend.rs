//! 后端协作接口
//!
//! 引擎只依赖这里定义的能力，具体网盘的请求/响应格式由实现方负责。

use crate::uploader::plan::TargetKind;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// 上传地址（通常是有时效的预签名 URL）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub url: String,
    /// 上传时需要附带的请求头
    pub headers: Vec<(String, String)>,
}

impl UploadTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// 分片序号 -> 上传地址
pub type TargetMap = HashMap<usize, UploadTarget>;

/// 预上传请求
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub name: String,
    pub size: u64,
    /// 目标目录（后端自行解释）
    pub destination: String,
}

/// 预上传结果
#[derive(Debug, Clone)]
pub struct PreparedUpload {
    pub session_id: String,
    /// 后端建议的分片大小，None 或 0 表示使用本地配置
    pub chunk_size_hint: Option<u64>,
}

/// 已上传分片的回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub seq: usize,
    pub size: u64,
    /// 服务端返回的 ETag（部分后端在提交时需要）
    pub etag: Option<String>,
}

/// 提交请求
#[derive(Debug, Clone)]
pub struct CompleteRequest {
    pub session_id: String,
    pub total_size: u64,
    pub is_multipart: bool,
    /// 按序号排列
    pub parts: Vec<PartReceipt>,
}

/// 网盘后端
#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// 创建上传会话，目标位置拒绝时返回错误
    async fn prepare_upload(&self, request: &PrepareRequest) -> Result<PreparedUpload>;

    /// 获取 [start_seq, end_seq) 的上传地址，初次获取与过期刷新共用
    async fn fetch_upload_targets(
        &self,
        session_id: &str,
        start_seq: usize,
        end_seq: usize,
        kind: TargetKind,
    ) -> Result<TargetMap>;

    /// 提交上传
    async fn complete_upload(&self, request: &CompleteRequest) -> Result<()>;
}
