//! 分块计划 - 根据文件大小计算分片大小和分片数量

/// 对象存储允许的最大分片编号
pub const MAX_PART_NUMBER: u32 = 10_000;

/// 分块计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// 文件总大小
    pub size: u64,
    /// 实际使用的分片大小
    pub chunk_size: u64,
    /// 分片数量，满足 `chunk_count == ceil(size / chunk_size)`
    pub chunk_count: u32,
}

impl ChunkPlan {
    /// 按目标分片大小切分；分片数超过 `max_chunks` 时放大分片，使数量不超过上限
    pub fn new(size: u64, chunk_size: u64, max_chunks: u32) -> Self {
        let max_chunks = u64::from(max_chunks.max(1));
        let mut chunk_size = chunk_size.max(1);

        if size.div_ceil(chunk_size) > max_chunks {
            chunk_size = size.div_ceil(max_chunks);
        }

        let chunk_count = size.div_ceil(chunk_size) as u32;
        Self {
            size,
            chunk_size,
            chunk_count,
        }
    }

    /// 分片编号（从 1 开始）
    pub fn parts(&self) -> impl Iterator<Item = u32> {
        1..=self.chunk_count
    }

    /// 分片的字节范围 `(offset, length)`
    pub fn range(&self, part_number: u32) -> (u64, u64) {
        let offset = u64::from(part_number.saturating_sub(1)) * self.chunk_size;
        let length = self.chunk_size.min(self.size.saturating_sub(offset));
        (offset, length)
    }
}
