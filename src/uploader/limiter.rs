// 上传限速
//
// 所有 worker 共享同一个令牌桶（单位：字节），限制的是总吞吐而不是单个分片的速度。
// 分片数据按 64KB 切块送入请求体，每块先取令牌再发送；取令牌时同时监听取消令牌。

use bytes::Bytes;
use futures::Stream;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::io;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// 每次取令牌的数据块大小
pub const PIECE_SIZE: usize = 64 * 1024;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// 分片请求体
///
/// 由后台任务按限速节奏推送数据块；`len` 为显式的 Content-Length。
pub struct ChunkBody {
    rx: ReceiverStream<io::Result<Bytes>>,
    len: u64,
}

impl ChunkBody {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Stream for ChunkBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// 上传限速器（可克隆，克隆体共享同一个令牌桶）
#[derive(Clone)]
pub struct UploadRateLimiter {
    limiter: Option<Arc<DirectLimiter>>,
    bytes_per_sec: Option<u64>,
}

impl std::fmt::Debug for UploadRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRateLimiter")
            .field("bytes_per_sec", &self.bytes_per_sec)
            .finish()
    }
}

impl UploadRateLimiter {
    /// 不限速
    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            bytes_per_sec: None,
        }
    }

    /// # 参数
    /// * `bytes_per_sec` - 总限速，None 或 0 表示不限速
    pub fn new(bytes_per_sec: Option<u64>) -> Self {
        let Some(rate) = bytes_per_sec.filter(|r| *r > 0) else {
            return Self::unlimited();
        };

        let rate_u32 = rate.min(u32::MAX as u64) as u32;
        let burst_u32 = rate_u32.max(PIECE_SIZE as u32);
        // 两个值都大于 0
        let (Some(rate_nz), Some(burst_nz)) = (NonZeroU32::new(rate_u32), NonZeroU32::new(burst_u32))
        else {
            return Self::unlimited();
        };

        let quota = Quota::per_second(rate_nz).allow_burst(burst_nz);
        Self {
            limiter: Some(Arc::new(RateLimiter::direct(quota))),
            bytes_per_sec: Some(rate),
        }
    }

    pub fn bytes_per_sec(&self) -> Option<u64> {
        self.bytes_per_sec
    }

    /// 把分片数据包装成限速的请求体
    ///
    /// 取消令牌触发后，请求体以 `Interrupted` 错误结束。
    pub fn limited_body(&self, data: Bytes, cancel: CancellationToken) -> ChunkBody {
        let len = data.len() as u64;
        let (tx, rx) = mpsc::channel(2);
        let limiter = self.limiter.clone();

        tokio::spawn(async move {
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + PIECE_SIZE).min(data.len());
                let piece = data.slice(offset..end);

                let ready = match (&limiter, NonZeroU32::new(piece.len() as u32)) {
                    (Some(limiter), Some(n)) => tokio::select! {
                        _ = cancel.cancelled() => Err(interrupted("上传已取消")),
                        r = limiter.until_n_ready(n) => {
                            r.map_err(|_| interrupted("限速令牌桶容量不足"))
                        }
                    },
                    _ if cancel.is_cancelled() => Err(interrupted("上传已取消")),
                    _ => Ok(()),
                };

                if let Err(e) = ready {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                // 接收端已关闭（请求被中止），停止推送
                if tx.send(Ok(piece)).await.is_err() {
                    return;
                }
                offset = end;
            }
        });

        ChunkBody {
            rx: ReceiverStream::new(rx),
            len,
        }
    }
}

fn interrupted(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, msg.to_string())
}
