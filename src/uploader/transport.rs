// 分片传输
//
// 把一个分片的数据 PUT 到上传地址，请求带显式的 Content-Length。
// 传输层只报告结果（成功 / HTTP 状态码），是否过期、是否可重试由 worker 判断。

use crate::config::UploadConfig;
use crate::uploader::backend::UploadTarget;
use crate::uploader::limiter::ChunkBody;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::{Body, Client};
use tracing::debug;

/// 错误响应体最多保留的字符数
const MAX_ERROR_BODY_CHARS: usize = 512;

/// 单次 PUT 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// 2xx，分片已被接收
    Stored { etag: Option<String> },
    /// 非成功状态码
    Status { status: u16, body: String },
}

/// 分片传输
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// 上传分片。网络层失败返回 Err，收到响应则返回 Ok(PutOutcome)
    async fn put_chunk(&self, target: &UploadTarget, body: ChunkBody) -> Result<PutOutcome>;
}

/// 基于 reqwest 的 HTTP PUT 实现
#[derive(Clone)]
pub struct HttpChunkTransport {
    client: Client,
}

impl HttpChunkTransport {
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.chunk_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChunkTransport for HttpChunkTransport {
    async fn put_chunk(&self, target: &UploadTarget, body: ChunkBody) -> Result<PutOutcome> {
        let len = body.len();
        let mut request = self
            .client
            .put(&target.url)
            .header(CONTENT_LENGTH, len);
        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .body(Body::wrap_stream(body))
            .send()
            .await
            .context("发送分片请求失败")?;

        let status = response.status();
        if status.is_success() {
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string());
            debug!("分片上传响应: status={}, etag={:?}", status, etag);
            return Ok(PutOutcome::Stored { etag });
        }

        let text = response.text().await.unwrap_or_default();
        Ok(PutOutcome::Status {
            status: status.as_u16(),
            body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        })
    }
}
