// 待上传文件描述
//
// 文件数据来源可以是本地路径（按需读取分片），也可以是内存中的字节

use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 文件数据来源
#[derive(Debug, Clone)]
pub enum FileSource {
    /// 本地文件
    Path(PathBuf),
    /// 内存数据
    Memory(Arc<Vec<u8>>),
}

/// 待上传文件
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// 文件名
    pub name: String,
    /// 相对路径（文件夹上传时保留目录结构，单文件时等于文件名）
    pub relative_path: String,
    /// 文件大小
    pub size: u64,
    /// 最后修改时间（Unix 毫秒）
    pub last_modified: i64,
    /// MIME 类型
    pub mime_type: String,
    /// 数据来源
    pub source: FileSource,
}

impl UploadFile {
    /// 从本地文件创建
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("读取文件元数据失败: {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {}", path.display());
        }

        let last_modified = metadata
            .modified()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            relative_path: name.clone(),
            mime_type: guess_mime_type(&name),
            name,
            size: metadata.len(),
            last_modified,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// 从内存数据创建
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>, last_modified: i64) -> Self {
        let name = name.into();
        Self {
            relative_path: name.clone(),
            mime_type: guess_mime_type(&name),
            size: data.len() as u64,
            name,
            last_modified,
            source: FileSource::Memory(Arc::new(data)),
        }
    }

    /// 设置相对路径
    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = relative_path.into();
        self
    }

    /// 设置 MIME 类型
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// 文件扩展名（小写，不含点）
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    /// 检查文件是否匹配允许的类型列表
    ///
    /// 列表项可以是扩展名（"jpg"、".jpg"），也可以是 MIME（"image/png"、"image/*"）
    /// 列表为空表示不限制
    pub fn matches_file_type(&self, patterns: &[String]) -> bool {
        if patterns.is_empty() {
            return true;
        }
        let extension = self.extension();
        let mime = self.mime_type.to_lowercase();

        patterns.iter().any(|pattern| {
            let pattern = pattern.trim().to_lowercase();
            if pattern.contains('/') {
                match pattern.strip_suffix("/*") {
                    Some(prefix) => mime.split('/').next() == Some(prefix),
                    None => mime == pattern,
                }
            } else {
                let pattern = pattern.trim_start_matches('.');
                extension.as_deref() == Some(pattern)
            }
        })
    }

    /// 读取指定字节范围的数据
    pub async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        match &self.source {
            FileSource::Memory(data) => {
                let start = range.start as usize;
                let end = range.end as usize;
                data.get(start..end)
                    .map(|slice| slice.to_vec())
                    .with_context(|| format!("分片范围越界: {}-{} / {}", start, end, data.len()))
            }
            FileSource::Path(path) => read_chunk_data(path, range).await,
        }
    }
}

/// 读取本地文件的分片数据
async fn read_chunk_data(local_path: &Path, range: Range<u64>) -> Result<Vec<u8>> {
    let local_path = local_path.to_path_buf();
    let start = range.start;
    let size = (range.end - range.start) as usize;

    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&local_path)
            .with_context(|| format!("无法打开文件: {:?}", local_path))?;
        file.seek(SeekFrom::Start(start))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)
            .with_context(|| format!("读取分片数据失败: {:?} @ {}", local_path, start))?;

        Ok(buffer)
    })
    .await?
}

/// 根据扩展名推断 MIME 类型，无法识别时为 application/octet-stream
fn guess_mime_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_bytes() {
        let file = UploadFile::from_bytes("photo.JPG", vec![0u8; 10], 1_700_000_000_000);
        assert_eq!(file.size, 10);
        assert_eq!(file.relative_path, "photo.JPG");
        assert_eq!(file.mime_type, "image/jpeg");
        assert_eq!(file.extension().as_deref(), Some("jpg"));
    }

    #[test]
    fn test_matches_file_type() {
        let file = UploadFile::from_bytes("photo.png", vec![1, 2, 3], 0);

        assert!(file.matches_file_type(&[]));
        assert!(file.matches_file_type(&["png".to_string()]));
        assert!(file.matches_file_type(&[".PNG".to_string()]));
        assert!(file.matches_file_type(&["image/*".to_string()]));
        assert!(file.matches_file_type(&["image/png".to_string()]));
        assert!(!file.matches_file_type(&["jpg".to_string(), "video/*".to_string()]));

        let no_ext = UploadFile::from_bytes("README", vec![], 0);
        assert!(!no_ext.matches_file_type(&["txt".to_string()]));
        assert_eq!(no_ext.mime_type, "application/octet-stream");
    }

    #[test]
    fn test_mime_patterns_cover_common_formats() {
        let video = vec!["video/*".to_string()];
        let movie = UploadFile::from_bytes("holiday.mkv", vec![0u8; 4], 0);
        assert!(movie.mime_type.starts_with("video/"));
        assert!(movie.matches_file_type(&video));
        assert!(UploadFile::from_bytes("clip.avi", vec![0u8; 4], 0).matches_file_type(&video));

        let document = UploadFile::from_bytes("report.docx", vec![0u8; 4], 0);
        assert!(document.matches_file_type(&["application/*".to_string()]));
        assert!(!document.matches_file_type(&video));
    }

    #[tokio::test]
    async fn test_read_range_memory() {
        let file = UploadFile::from_bytes("a.bin", (0u8..10).collect(), 0);
        assert_eq!(file.read_range(2..5).await.unwrap(), vec![2, 3, 4]);
        assert!(file.read_range(8..20).await.is_err());
    }

    #[tokio::test]
    async fn test_from_path_and_read_range() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"hello resumable world").unwrap();
        tmp.flush().unwrap();

        let file = UploadFile::from_path(tmp.path()).await.unwrap();
        assert_eq!(file.size, 21);
        assert!(file.last_modified > 0);

        let data = file.read_range(6..15).await.unwrap();
        assert_eq!(data, b"resumable");
    }

    #[tokio::test]
    async fn test_from_path_missing_file() {
        assert!(UploadFile::from_path("/definitely/not/here.bin").await.is_err());
    }
}
