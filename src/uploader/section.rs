// 分片读取池
//
// 为每个分片提供一个有界、可 seek、独占的读取视图 [offset, offset+length)：
// - 本地文件：按偏移独立读取，支持任意顺序
// - 内存数据：零拷贝切片
// - 一次性流：只能按偏移递增顺序连续读取
//
// 池的容量（同时借出的读取器数量）等于上传线程数，内存占用上限为 线程数 × 分片大小。
// 借出记录以分片序号为索引，归还后序号位被清除。

use crate::error::UploadError;
use bit_set::BitSet;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// 上传源数据
pub struct UploadSource {
    inner: SourceInner,
    size: u64,
}

enum SourceInner {
    File(PathBuf),
    Memory(Bytes),
    Stream(tokio::sync::Mutex<StreamCursor>),
}

/// 一次性流的读取位置
struct StreamCursor {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    position: u64,
}

impl UploadSource {
    /// 本地文件
    pub async fn open_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("无法读取文件信息: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }
        Ok(Self {
            inner: SourceInner::File(path),
            size: metadata.len(),
        })
    }

    /// 内存数据
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            inner: SourceInner::Memory(data),
        }
    }

    /// 只能读一次的流（例如网络流），需要调用方给出总大小
    pub fn from_reader<R>(reader: R, size: u64) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: SourceInner::Stream(tokio::sync::Mutex::new(StreamCursor {
                reader: Box::new(reader),
                position: 0,
            })),
            size,
        }
    }

    /// 源数据总大小
    pub fn size(&self) -> u64 {
        self.size
    }

    /// 读取 [offset, offset+length) 的数据
    async fn read_section(&self, offset: u64, length: u64) -> anyhow::Result<Bytes> {
        match &self.inner {
            SourceInner::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || -> anyhow::Result<Bytes> {
                    let mut file = std::fs::File::open(&path)
                        .map_err(|e| anyhow::anyhow!("无法打开文件 {:?}: {}", path, e))?;
                    file.seek(SeekFrom::Start(offset))?;
                    let mut buffer = vec![0u8; length as usize];
                    file.read_exact(&mut buffer)?;
                    Ok(Bytes::from(buffer))
                })
                .await?
            }
            SourceInner::Memory(data) => Ok(data.slice(offset as usize..(offset + length) as usize)),
            SourceInner::Stream(cursor) => {
                use tokio::io::AsyncReadExt;

                let mut cursor = cursor.lock().await;
                if cursor.position != offset {
                    anyhow::bail!(
                        "流式数据只能顺序读取: 请求偏移={}, 当前位置={}",
                        offset,
                        cursor.position
                    );
                }
                let mut buffer = vec![0u8; length as usize];
                cursor.reader.read_exact(&mut buffer).await?;
                cursor.position += length;
                Ok(Bytes::from(buffer))
            }
        }
    }
}

/// 池内共享状态
#[derive(Default)]
struct PoolShared {
    /// 当前借出的分片序号
    outstanding: Mutex<BitSet>,
    acquired: AtomicUsize,
    recycled: AtomicUsize,
}

/// 单个分片的读取视图
///
/// 非并发安全：同一时刻只被一个 worker 持有，覆盖该分片的全部重试。
pub struct SectionReader {
    seq: usize,
    offset: u64,
    cursor: Cursor<Bytes>,
    shared: Arc<PoolShared>,
    _slot: OwnedSemaphorePermit,
    recycled: bool,
}

impl SectionReader {
    pub fn seq(&self) -> usize {
        self.seq
    }

    /// 在源数据中的起始偏移
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 从当前位置到窗口末尾的数据（零拷贝）
    pub fn remaining(&self) -> Bytes {
        let data = self.cursor.get_ref();
        let pos = (self.cursor.position() as usize).min(data.len());
        data.slice(pos..)
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for SectionReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl Drop for SectionReader {
    fn drop(&mut self) {
        self.shared.outstanding.lock().remove(self.seq);
        if !self.recycled {
            warn!("[分片#{}] 读取器未归还即被释放", self.seq);
        }
    }
}

/// 分片读取池
pub struct SectionReaderPool {
    source: UploadSource,
    slots: Arc<Semaphore>,
    shared: Arc<PoolShared>,
}

impl SectionReaderPool {
    /// # 参数
    /// * `source` - 源数据
    /// * `capacity` - 同时借出的读取器上限
    pub fn new(source: UploadSource, capacity: usize) -> Self {
        Self {
            source,
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            shared: Arc::new(PoolShared::default()),
        }
    }

    pub fn source_size(&self) -> u64 {
        self.source.size()
    }

    /// 借出分片 `seq` 的读取器，位置在窗口起点
    pub async fn get_section_reader(
        &self,
        seq: usize,
        offset: u64,
        length: u64,
    ) -> Result<SectionReader, UploadError> {
        let read_err = |message: String| UploadError::SourceRead { seq, message };

        if offset
            .checked_add(length)
            .map_or(true, |end| end > self.source.size())
        {
            return Err(read_err(format!(
                "读取范围越界: offset={}, length={}, 源大小={}",
                offset,
                length,
                self.source.size()
            )));
        }
        if !self.shared.outstanding.lock().insert(seq) {
            return Err(read_err("该分片的读取器已被借出".to_string()));
        }

        let slot = match self.slots.clone().acquire_owned().await {
            Ok(slot) => slot,
            Err(_) => {
                self.shared.outstanding.lock().remove(seq);
                return Err(read_err("读取池已关闭".to_string()));
            }
        };

        let data = match self.source.read_section(offset, length).await {
            Ok(data) => data,
            Err(e) => {
                self.shared.outstanding.lock().remove(seq);
                return Err(read_err(format!("{:#}", e)));
            }
        };

        self.shared.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(
            "[分片#{}] 借出读取器: bytes={}-{}",
            seq,
            offset,
            offset + length - 1
        );

        Ok(SectionReader {
            seq,
            offset,
            cursor: Cursor::new(data),
            shared: self.shared.clone(),
            _slot: slot,
            recycled: false,
        })
    }

    /// 归还读取器，释放槽位给后续分片
    pub fn recycle_section_reader(&self, mut reader: SectionReader) {
        reader.recycled = true;
        self.shared.recycled.fetch_add(1, Ordering::SeqCst);
        debug!("[分片#{}] 归还读取器", reader.seq);
        drop(reader);
    }

    /// 当前借出中的读取器数量
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.lock().len()
    }

    /// (借出次数, 归还次数)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.shared.acquired.load(Ordering::SeqCst),
            self.shared.recycled.load(Ordering::SeqCst),
        )
    }
}
