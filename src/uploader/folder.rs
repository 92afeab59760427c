//! 文件夹扫描
//!
//! 负责:
//! - 递归扫描本地文件夹
//! - 生成带目录结构的相对路径（`根目录名/子目录/文件名`），随分片一起上报
//! - 转换为待上传文件

use crate::uploader::UploadFile;
use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// 文件扫描结果
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 上报给服务器的相对路径（使用 `/` 分隔）
    pub relative_path: String,
    /// 文件大小（字节）
    pub size: u64,
}

impl ScannedFile {
    /// 转换为待上传文件
    pub async fn to_upload_file(&self) -> Result<UploadFile> {
        let file = UploadFile::from_path(&self.local_path).await?;
        Ok(file.with_relative_path(self.relative_path.clone()))
    }
}

/// 文件夹扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
    /// 最大递归深度（None 表示不限制）
    pub max_depth: Option<usize>,
}

/// 文件夹扫描器
#[derive(Debug, Clone, Default)]
pub struct FolderScanner {
    options: ScanOptions,
}

impl FolderScanner {
    /// 创建默认配置的扫描器
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建自定义配置的扫描器
    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 递归扫描文件夹
    ///
    /// # 参数
    /// - `root_path`: 要扫描的文件夹路径
    ///
    /// # 返回
    /// - 扫描到的所有文件，按相对路径排序
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<ScannedFile>> {
        let root_path = root_path.as_ref();

        if !root_path.exists() {
            anyhow::bail!("扫描路径不存在: {}", root_path.display());
        }
        if !root_path.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root_path.display());
        }

        info!("开始扫描文件夹: {}", root_path.display());

        let root_name = root_path
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let mut walker = WalkDir::new(root_path).follow_links(self.options.follow_symlinks);
        if let Some(max_depth) = self.options.max_depth {
            walker = walker.max_depth(max_depth);
        }

        let skip_hidden = self.options.skip_hidden;
        let mut files = Vec::new();
        for entry in walker
            .into_iter()
            .filter_entry(|e| !(skip_hidden && e.depth() > 0 && is_hidden(e)))
        {
            let entry = entry
                .with_context(|| format!("扫描目录失败: {}", root_path.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = entry
                .metadata()
                .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?;
            let relative = entry
                .path()
                .strip_prefix(root_path)
                .with_context(|| format!("计算相对路径失败: {}", entry.path().display()))?;
            let relative_path = join_relative(&root_name, relative);

            debug!("扫描到文件: {} ({} bytes)", relative_path, metadata.len());
            files.push(ScannedFile {
                local_path: entry.path().to_path_buf(),
                relative_path,
                size: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(
            "文件夹扫描完成: {} 个文件，总大小 {}",
            files.len(),
            format_bytes(files.iter().map(|f| f.size).sum())
        );

        Ok(files)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// 拼接相对路径，统一使用 `/` 分隔
fn join_relative(root_name: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !root_name.is_empty() {
        parts.push(root_name.to_string());
    }
    parts.extend(relative.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    }));
    parts.join("/")
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// 创建测试目录结构
    fn create_test_folder() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("photos");

        // photos/
        // ├── a.png
        // ├── .cache/
        // │   └── thumb.png
        // └── 2024/
        //     └── trip/
        //         └── b.png
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::create_dir_all(root.join("2024/trip")).unwrap();
        fs::write(root.join("a.png"), "aaaa").unwrap();
        fs::write(root.join(".cache/thumb.png"), "t").unwrap();
        fs::write(root.join("2024/trip/b.png"), "bbbbbbbb").unwrap();

        (temp_dir, root)
    }

    fn relative_paths(files: &[ScannedFile]) -> Vec<&str> {
        files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn test_scan_folder() {
        let (_guard, root) = create_test_folder();
        let files = FolderScanner::new().scan(&root).unwrap();

        assert_eq!(
            relative_paths(&files),
            vec!["photos/.cache/thumb.png", "photos/2024/trip/b.png", "photos/a.png"]
        );
        assert_eq!(files[1].size, 8);
        assert_eq!(files[1].local_path, root.join("2024/trip/b.png"));
    }

    #[test]
    fn test_scan_skip_hidden_and_depth() {
        let (_guard, root) = create_test_folder();

        let scanner = FolderScanner::with_options(ScanOptions {
            skip_hidden: true,
            ..Default::default()
        });
        let files = scanner.scan(&root).unwrap();
        assert_eq!(
            relative_paths(&files),
            vec!["photos/2024/trip/b.png", "photos/a.png"]
        );

        let scanner = FolderScanner::with_options(ScanOptions {
            max_depth: Some(1),
            ..Default::default()
        });
        let files = scanner.scan(&root).unwrap();
        assert_eq!(relative_paths(&files), vec!["photos/a.png"]);
    }

    #[test]
    fn test_scan_invalid_roots() {
        let scanner = FolderScanner::new();
        let err = scanner.scan("/nonexistent/path").unwrap_err();
        assert!(err.to_string().contains("扫描路径不存在"));

        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("test.txt");
        fs::write(&file_path, "content").unwrap();
        let err = scanner.scan(&file_path).unwrap_err();
        assert!(err.to_string().contains("扫描路径不是文件夹"));
    }

    #[tokio::test]
    async fn test_to_upload_file_keeps_relative_path() {
        let (_guard, root) = create_test_folder();
        let files = FolderScanner::new().scan(&root).unwrap();

        let file = files[1].to_upload_file().await.unwrap();
        assert_eq!(file.name, "b.png");
        assert_eq!(file.relative_path, "photos/2024/trip/b.png");
        assert_eq!(file.size, 8);
        assert_eq!(file.mime_type, "image/png");
        assert_eq!(file.read_range(0..4).await.unwrap(), b"bbbb");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536 * 1024 * 1024), "1.50 GB");
    }
}
