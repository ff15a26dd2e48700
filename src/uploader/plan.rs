// 分片规划
//
// 规则：
// - chunk_size = min(文件大小, 分片上限)
// - chunk_count = ceil(文件大小 / chunk_size)，最后一片为余数（整除时为完整分片）
// - 单分片会话走单片授权接口，批次宽度为 1
// - 多分片会话按批次获取预签名地址，减少往返次数

use crate::error::UploadError;
use std::ops::Range;
use tracing::debug;

/// 多分片会话的默认批次宽度
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// 上传地址的获取方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// 单分片会话：单片授权
    SingleAuth,
    /// 多分片会话：批量预签名地址
    PreSigned,
}

/// 上传分片（规划后不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 分片序号，从 1 开始
    pub seq: usize,
    /// 起始偏移
    pub offset: u64,
    /// 分片大小
    pub size: u64,
}

impl Chunk {
    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }
}

/// 一批分片序号 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Batch {
    pub start: usize,
    pub end: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, seq: usize) -> bool {
        (self.start..self.end).contains(&seq)
    }

    pub fn seqs(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// 分片规划结果
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: usize,
    pub last_chunk_size: u64,
    pub batch_size: usize,
    chunks: Vec<Chunk>,
}

impl UploadPlan {
    /// 计算分片与批次
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `max_chunk_size` - 分片大小上限
    /// * `multi_batch_size` - 多分片会话的批次宽度
    pub fn new(
        total_size: u64,
        max_chunk_size: u64,
        multi_batch_size: usize,
    ) -> Result<Self, UploadError> {
        if total_size == 0 {
            return Err(UploadError::Planning("文件大小必须大于 0".to_string()));
        }
        if max_chunk_size == 0 {
            return Err(UploadError::Planning("分片大小上限必须大于 0".to_string()));
        }
        if multi_batch_size == 0 {
            return Err(UploadError::Planning("批次宽度必须大于 0".to_string()));
        }

        let chunk_size = total_size.min(max_chunk_size);
        let chunk_count = total_size.div_ceil(chunk_size) as usize;
        let last_chunk_size = match total_size % chunk_size {
            0 => chunk_size,
            rem => rem,
        };
        let batch_size = if chunk_count == 1 { 1 } else { multi_batch_size };

        let chunks = (1..=chunk_count)
            .map(|seq| Chunk {
                seq,
                offset: (seq as u64 - 1) * chunk_size,
                size: if seq == chunk_count {
                    last_chunk_size
                } else {
                    chunk_size
                },
            })
            .collect();

        debug!(
            "分片规划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}, 批次宽度={}",
            total_size, chunk_size, chunk_count, batch_size
        );

        Ok(Self {
            total_size,
            chunk_size,
            chunk_count,
            last_chunk_size,
            batch_size,
            chunks,
        })
    }

    /// 所有分片（按序号排列）
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// 按序号获取分片
    pub fn chunk(&self, seq: usize) -> Option<&Chunk> {
        seq.checked_sub(1).and_then(|i| self.chunks.get(i))
    }

    /// 按顺序划分批次
    pub fn batches(&self) -> impl Iterator<Item = Batch> + '_ {
        (1..=self.chunk_count)
            .step_by(self.batch_size)
            .map(move |start| Batch {
                start,
                end: (start + self.batch_size).min(self.chunk_count + 1),
            })
    }

    pub fn target_kind(&self) -> TargetKind {
        if self.chunk_count == 1 {
            TargetKind::SingleAuth
        } else {
            TargetKind::PreSigned
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.chunk_count > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_example_three_chunks_one_batch() {
        let plan = UploadPlan::new(40 * MIB, 16 * MIB, DEFAULT_BATCH_SIZE).unwrap();
        assert_eq!(plan.chunk_count, 3);
        assert_eq!(plan.chunk_size, 16 * MIB);
        assert_eq!(plan.last_chunk_size, 8 * MIB);
        let sizes: Vec<u64> = plan.chunks().iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![16 * MIB, 16 * MIB, 8 * MIB]);
        assert_eq!(plan.chunk(3).unwrap().range(), 32 * MIB..40 * MIB);

        let batches: Vec<Batch> = plan.batches().collect();
        assert_eq!(batches, vec![Batch { start: 1, end: 4 }]);
        assert_eq!(plan.target_kind(), TargetKind::PreSigned);
        assert!(plan.is_multipart());
    }

    #[test]
    fn test_example_single_chunk() {
        let plan = UploadPlan::new(8 * MIB, 16 * MIB, DEFAULT_BATCH_SIZE).unwrap();
        assert_eq!(plan.chunk_count, 1);
        assert_eq!(plan.batch_size, 1);
        assert_eq!(plan.chunk_size, 8 * MIB);
        assert_eq!(plan.last_chunk_size, 8 * MIB);
        assert_eq!(plan.target_kind(), TargetKind::SingleAuth);
        assert!(!plan.is_multipart());
    }

    #[test]
    fn test_even_division_last_chunk_full() {
        let plan = UploadPlan::new(32 * MIB, 16 * MIB, DEFAULT_BATCH_SIZE).unwrap();
        assert_eq!(plan.chunk_count, 2);
        assert_eq!(plan.last_chunk_size, 16 * MIB);
    }

    #[test]
    fn test_multiple_batches() {
        let plan = UploadPlan::new(25, 1, 10).unwrap();
        let batches: Vec<Batch> = plan.batches().collect();
        assert_eq!(
            batches,
            vec![
                Batch { start: 1, end: 11 },
                Batch { start: 11, end: 21 },
                Batch { start: 21, end: 26 },
            ]
        );
        assert!(plan.chunk(0).is_none());
        assert!(plan.chunk(26).is_none());
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            UploadPlan::new(0, 16 * MIB, 10),
            Err(UploadError::Planning(_))
        ));
        assert!(matches!(
            UploadPlan::new(16 * MIB, 0, 10),
            Err(UploadError::Planning(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_chunks_partition_file(total in 1u64..10_000_000, max in 1_000u64..2_000_000) {
            let plan = UploadPlan::new(total, max, DEFAULT_BATCH_SIZE).unwrap();
            let sum: u64 = plan.chunks().iter().map(|c| c.size).sum();
            prop_assert_eq!(sum, total);
            prop_assert_eq!(plan.chunk_count as u64, total.div_ceil(plan.chunk_size));

            let mut expected_offset = 0;
            for (i, chunk) in plan.chunks().iter().enumerate() {
                prop_assert_eq!(chunk.seq, i + 1);
                prop_assert_eq!(chunk.offset, expected_offset);
                if chunk.seq < plan.chunk_count {
                    prop_assert_eq!(chunk.size, plan.chunk_size);
                }
                expected_offset += chunk.size;
            }
        }

        #[test]
        fn prop_batches_partition_seqs(count in 1u64..500, batch in 1usize..32) {
            let plan = UploadPlan::new(count, 1, batch).unwrap();
            let mut next = 1;
            for b in plan.batches() {
                prop_assert_eq!(b.start, next);
                prop_assert!(!b.is_empty());
                prop_assert!(b.len() <= plan.batch_size);
                next = b.end;
            }
            prop_assert_eq!(next, plan.chunk_count + 1);
        }
    }
}
