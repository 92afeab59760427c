// 分片传输
//
// 单个分片的网络交换，与调度无关：
// 1. （可选）探测请求：询问服务器该分片是否已存在，用于断点续传
// 2. 分片数据上传
//
// 结果分类：
// - 2xx：成功
// - permanent_errors 中的状态码：不可重试（服务器的类型/大小校验拒绝）
// - 其他状态码、超时、连接错误：可重试

use crate::config::{HttpMethod, UploadConfig, UploadMethod};
use crate::error::{UploadError, UploadResult};
use crate::uploader::UploadFile;
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 单个分片的传输请求
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    /// 文件标识
    pub file_id: String,
    /// 文件描述
    pub file: Arc<UploadFile>,
    /// 分片索引（从 0 开始）
    pub chunk_index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 总分片数
    pub total_chunks: usize,
    /// 配置的分片大小
    pub chunk_size: u64,
    /// 上传地址
    pub endpoint: String,
    /// 附加请求头
    pub headers: BTreeMap<String, String>,
    /// 附加查询参数
    pub query: BTreeMap<String, String>,
}

impl ChunkRequest {
    /// 当前分片实际大小
    pub fn current_chunk_size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 协议字段（与 Resumable.js 服务端兼容的字段名）
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            chunk_number: self.chunk_index + 1,
            chunk_size: self.chunk_size,
            current_chunk_size: self.current_chunk_size(),
            total_size: self.file.size,
            file_type: self.file.mime_type.clone(),
            identifier: self.file_id.clone(),
            file_name: self.file.name.clone(),
            relative_path: self.file.relative_path.clone(),
            total_chunks: self.total_chunks,
        }
    }
}

/// 分片协议字段
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChunkParams {
    /// 分片序号（从 1 开始）
    #[serde(rename = "resumableChunkNumber")]
    pub chunk_number: usize,
    #[serde(rename = "resumableChunkSize")]
    pub chunk_size: u64,
    #[serde(rename = "resumableCurrentChunkSize")]
    pub current_chunk_size: u64,
    #[serde(rename = "resumableTotalSize")]
    pub total_size: u64,
    #[serde(rename = "resumableType")]
    pub file_type: String,
    #[serde(rename = "resumableIdentifier")]
    pub identifier: String,
    #[serde(rename = "resumableFilename")]
    pub file_name: String,
    #[serde(rename = "resumableRelativePath")]
    pub relative_path: String,
    #[serde(rename = "resumableTotalChunks")]
    pub total_chunks: usize,
}

impl ChunkParams {
    /// 以 (字段名, 值) 列表形式输出，用于 multipart 表单
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("resumableChunkNumber", self.chunk_number.to_string()),
            ("resumableChunkSize", self.chunk_size.to_string()),
            ("resumableCurrentChunkSize", self.current_chunk_size.to_string()),
            ("resumableTotalSize", self.total_size.to_string()),
            ("resumableType", self.file_type.clone()),
            ("resumableIdentifier", self.identifier.clone()),
            ("resumableFilename", self.file_name.clone()),
            ("resumableRelativePath", self.relative_path.clone()),
            ("resumableTotalChunks", self.total_chunks.to_string()),
        ]
    }
}

/// 分片传输结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 成功，附带服务器响应
    Success(String),
    /// 可重试失败
    Retryable(String),
    /// 不可重试失败
    Fatal(String),
}

/// 分片传输接口
///
/// 实现不能在两次调用之间保留状态
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn send(&self, request: &ChunkRequest) -> ChunkOutcome;
}

/// 基于 reqwest 的 HTTP 分片传输
#[derive(Debug, Clone)]
pub struct HttpChunkTransport {
    /// HTTP客户端
    client: Client,
    /// 是否先探测
    test_chunks: bool,
    /// 探测请求方法
    test_method: HttpMethod,
    /// 请求体格式
    upload_method: UploadMethod,
    /// 上传请求方法
    http_method: HttpMethod,
    /// 分片数据字段名
    file_parameter_name: String,
    /// 不可重试的状态码
    permanent_errors: Vec<u16>,
}

impl HttpChunkTransport {
    /// 根据上传配置创建
    pub fn new(config: &UploadConfig) -> UploadResult<Self> {
        let mut builder = Client::builder();
        if config.request_timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(config.request_timeout_ms));
        }
        let client = builder
            .build()
            .map_err(|e| UploadError::InvalidConfig(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            test_chunks: config.test_chunks,
            test_method: config.test_method,
            upload_method: config.upload_method,
            http_method: config.http_method,
            file_parameter_name: config.file_parameter_name.clone(),
            permanent_errors: config.permanent_errors.clone(),
        })
    }

    /// 探测分片是否已存在
    ///
    /// 返回 Some(响应) 表示服务器已有该分片；探测失败时按不存在处理
    async fn test_chunk(&self, request: &ChunkRequest) -> Option<String> {
        let params = request.params();
        let builder = self
            .client
            .request(self.test_method.as_reqwest(), &request.endpoint)
            .query(&request.query)
            .query(&params);

        let response = match apply_headers(builder, &request.headers).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(
                    "[{}] 分片 #{} 探测请求失败，直接上传: {}",
                    request.file_id, request.chunk_index, e
                );
                return None;
            }
        };

        let status = response.status().as_u16();
        if status == 200 || status == 201 {
            let body = response.text().await.unwrap_or_default();
            debug!(
                "[{}] 分片 #{} 服务器已存在，跳过上传",
                request.file_id, request.chunk_index
            );
            Some(body)
        } else {
            None
        }
    }

    /// 上传分片数据
    async fn upload_chunk(&self, request: &ChunkRequest, data: Vec<u8>) -> ChunkOutcome {
        let params = request.params();
        let builder = self
            .client
            .request(self.http_method.as_reqwest(), &request.endpoint)
            .query(&request.query);

        let builder = match self.upload_method {
            UploadMethod::Octet => builder
                .query(&params)
                .header("Content-Type", "application/octet-stream")
                .body(data),
            UploadMethod::Multipart => {
                let part = match multipart::Part::bytes(data)
                    .file_name(request.file.name.clone())
                    .mime_str("application/octet-stream")
                {
                    Ok(part) => part,
                    Err(e) => return ChunkOutcome::Fatal(format!("构建 multipart 失败: {}", e)),
                };
                let form = params
                    .to_pairs()
                    .into_iter()
                    .fold(multipart::Form::new(), |form, (key, value)| {
                        form.text(key, value)
                    })
                    .part(self.file_parameter_name.clone(), part);
                builder.multipart(form)
            }
        };

        let response = match apply_headers(builder, &request.headers).send().await {
            Ok(r) => r,
            Err(e) => return classify_request_error(&e),
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return ChunkOutcome::Retryable(format!("读取响应失败: {}", e)),
        };

        classify_status(status, body, &self.permanent_errors)
    }
}

#[async_trait]
impl ChunkTransport for HttpChunkTransport {
    async fn send(&self, request: &ChunkRequest) -> ChunkOutcome {
        if self.test_chunks {
            if let Some(body) = self.test_chunk(request).await {
                return ChunkOutcome::Success(body);
            }
        }

        let data = match request.file.read_range(request.range.clone()).await {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "[{}] 分片 #{} 读取失败: {:#}",
                    request.file_id, request.chunk_index, e
                );
                return ChunkOutcome::Fatal(format!("读取分片数据失败: {:#}", e));
            }
        };

        debug!(
            "[{}] 分片 #{} 开始上传 (范围: {}-{}, 大小: {} bytes)",
            request.file_id,
            request.chunk_index,
            request.range.start,
            request.range.end,
            data.len()
        );

        self.upload_chunk(request, data).await
    }
}

fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &BTreeMap<String, String>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

/// 按状态码分类上传结果
pub fn classify_status(status: u16, body: String, permanent_errors: &[u16]) -> ChunkOutcome {
    if (200..300).contains(&status) {
        ChunkOutcome::Success(body)
    } else if permanent_errors.contains(&status) {
        ChunkOutcome::Fatal(format!("服务器拒绝分片: HTTP {} {}", status, body.trim()))
    } else {
        ChunkOutcome::Retryable(format!("HTTP {} {}", status, body.trim()))
    }
}

/// 请求发送错误分类
fn classify_request_error(error: &reqwest::Error) -> ChunkOutcome {
    if error.is_builder() {
        ChunkOutcome::Fatal(format!("构建请求失败: {}", error))
    } else if error.is_timeout() {
        ChunkOutcome::Retryable(format!("请求超时: {}", error))
    } else {
        ChunkOutcome::Retryable(format!("网络错误: {}", error))
    }
}
