// 上传引擎模块
//
// - file: 待上传文件描述和分片数据读取
// - identity: 文件唯一标识
// - chunk: 分片规划
// - session: 单文件上传会话状态机
// - transport: 分片网络传输（探测 + 上传）
// - scheduler: 全局调度状态和退避策略
// - engine: 对外接口，串联以上各部分
// - folder: 文件夹扫描

pub mod chunk;
pub mod engine;
pub mod file;
pub mod folder;
pub mod identity;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use chunk::{calculate_chunks, ChunkPlanner, ChunkStatus, UploadChunk};
pub use engine::{server_file_name, UploadEngine};
pub use file::{FileSource, UploadFile};
pub use folder::{FolderScanner, ScanOptions, ScannedFile};
pub use identity::{compute_file_identifier, default_file_identifier, IdentifierGenerator};
pub use scheduler::{calculate_backoff_delay, DrainSummary, MAX_BACKOFF_MS};
pub use session::{DispatchedChunk, RetryDecision, SessionSnapshot, SessionStatus, UploadSession};
pub use transport::{ChunkOutcome, ChunkParams, ChunkRequest, ChunkTransport, HttpChunkTransport};
