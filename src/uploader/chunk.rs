// 上传分片规划
//
// 将文件按固定大小切分为连续、不重叠的字节范围（最后一个分片可以更短），
// 并计算文件标识，生成新的上传会话

use crate::error::{UploadError, UploadResult};
use crate::uploader::identity::{compute_file_identifier, IdentifierGenerator};
use crate::uploader::{UploadFile, UploadSession};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

/// 分片状态
///
/// 只能按 `Pending → Uploading → {Success | Failed}` 推进，
/// `Failed → Pending` 只能由重试策略触发
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Success,
    Failed,
}

/// 上传分片信息
#[derive(Debug, Clone)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 分片状态
    pub status: ChunkStatus,
    /// 重试次数
    pub retries: u32,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            status: ChunkStatus::Pending,
            retries: 0,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_success(&self) -> bool {
        self.status == ChunkStatus::Success
    }
}

/// 分片规划器
#[derive(Clone, Default)]
pub struct ChunkPlanner {
    /// 自定义文件标识生成器
    identifier: Option<IdentifierGenerator>,
}

impl std::fmt::Debug for ChunkPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPlanner")
            .field("custom_identifier", &self.identifier.is_some())
            .finish()
    }
}

impl ChunkPlanner {
    /// 使用默认文件标识策略
    pub fn new() -> Self {
        Self { identifier: None }
    }

    /// 使用自定义文件标识生成器
    pub fn with_identifier(identifier: IdentifierGenerator) -> Self {
        Self {
            identifier: Some(identifier),
        }
    }

    /// 计算文件标识
    pub fn file_id(&self, file: &UploadFile) -> String {
        compute_file_identifier(file, self.identifier.as_ref())
    }

    /// 规划上传会话
    ///
    /// # 参数
    /// * `file` - 待上传文件
    /// * `chunk_size` - 分片大小，必须大于 0
    pub fn plan(&self, file: UploadFile, chunk_size: u64) -> UploadResult<UploadSession> {
        let chunks = calculate_chunks(file.size, chunk_size)?;
        let file_id = self.file_id(&file);

        debug!(
            "规划上传会话: file={}, id={}, 大小={} bytes, 分片大小={} bytes, 分片数量={}",
            file.name,
            file_id,
            file.size,
            chunk_size,
            chunks.len()
        );

        Ok(UploadSession::new(file_id, file, chunks))
    }
}

/// 计算分片
///
/// 空文件也生成一个空分片，保证至少发送一次请求
pub fn calculate_chunks(total_size: u64, chunk_size: u64) -> UploadResult<Vec<UploadChunk>> {
    if chunk_size == 0 {
        return Err(UploadError::InvalidConfig(
            "chunk_size 必须大于 0".to_string(),
        ));
    }

    if total_size == 0 {
        return Ok(vec![UploadChunk::new(0, 0..0)]);
    }

    let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset + chunk_size, total_size);
        chunks.push(UploadChunk::new(index, offset..end));
        offset = end;
        index += 1;
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_creation() {
        let chunk = UploadChunk::new(0, 0..1024);
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.size(), 1024);
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.retries, 0);
    }

    #[test]
    fn test_chunk_calculation() {
        // 完整分片
        let chunks = calculate_chunks(16 * MB, 4 * MB).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].range, 0..(4 * MB));
        assert_eq!(chunks[3].range, (12 * MB)..(16 * MB));

        // 最后一个分片更短
        let chunks = calculate_chunks(5 * MB / 2, MB).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].size(), MB);
        assert_eq!(chunks[1].size(), MB);
        assert_eq!(chunks[2].size(), MB / 2);
    }

    #[test]
    fn test_small_and_empty_file() {
        let chunks = calculate_chunks(100, MB).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range, 0..100);

        let chunks = calculate_chunks(0, MB).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size(), 0);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            calculate_chunks(100, 0),
            Err(UploadError::InvalidConfig(_))
        ));

        let planner = ChunkPlanner::new();
        let file = UploadFile::from_bytes("a.bin", vec![0u8; 10], 0);
        assert!(planner.plan(file, 0).is_err());
    }

    #[test]
    fn test_plan_creates_queued_session() {
        let planner = ChunkPlanner::new();
        let file = UploadFile::from_bytes("a.bin", vec![0u8; 2500], 42);
        let session = planner.plan(file, 1000).unwrap();

        assert_eq!(session.total_chunks(), 3);
        assert_eq!(session.progress(), 0.0);
        assert!(session.file_id().starts_with("2500-"));
    }

    proptest! {
        #[test]
        fn prop_chunks_cover_file_exactly(total in 1u64..2_000_000, chunk_size in 512u64..1_000_000) {
            let chunks = calculate_chunks(total, chunk_size).unwrap();

            // 无重叠、无空洞
            let mut expected_start = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.range.start, expected_start);
                prop_assert!(chunk.size() > 0);
                prop_assert!(chunk.size() <= chunk_size);
                expected_start = chunk.range.end;
            }
            prop_assert_eq!(expected_start, total);
            prop_assert_eq!(chunks.iter().map(|c| c.size()).sum::<u64>(), total);
            prop_assert_eq!(chunks.len() as u64, total.div_ceil(chunk_size));
        }
    }
}
