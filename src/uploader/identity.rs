// 文件唯一标识
//
// 标识用于断点续传匹配：同一个文件重新添加时必须得到相同的标识，
// 服务端据此识别已存储的分片

use crate::uploader::UploadFile;
use md5::Context as Md5Context;
use std::sync::Arc;

/// 自定义文件标识生成器
pub type IdentifierGenerator = Arc<dyn Fn(&UploadFile) -> String + Send + Sync>;

/// 默认文件标识：`{size}-{md5(relative_path, size, last_modified)}`
///
/// 只依赖文件元数据，不读取文件内容
pub fn default_file_identifier(file: &UploadFile) -> String {
    let mut hasher = Md5Context::new();
    hasher.consume(file.relative_path.as_bytes());
    hasher.consume(b"\0");
    hasher.consume(file.size.to_le_bytes());
    hasher.consume(file.last_modified.to_le_bytes());
    format!("{}-{:x}", file.size, hasher.compute())
}

/// 使用指定生成器（或默认策略）计算文件标识
pub fn compute_file_identifier(file: &UploadFile, generator: Option<&IdentifierGenerator>) -> String {
    match generator {
        Some(generate) => generate(file),
        None => default_file_identifier(file),
    }
}
