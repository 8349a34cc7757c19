pub mod codec;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transfer;

pub use codec::{MessageStream, SOCKET_TIMEOUT};
pub use protocol::{
    AccountData, Command, CrcMessage, CreateDirectoryRequest, DigestResponse, DirIdRequest,
    DirectoryName, DirectoryResponse, Envelope, ErrorCode, FileIdRequest, FileListResponse,
    FileResponse, LoginRequest, LoginResponse, MAX_MESSAGE_SIZE, ProtocolError, ROOT_DIR_ID,
    SetDirectoryInfoRequest, SetFileInfoRequest, TEMP_SUFFIX, TRANSFER_CHUNK_SIZE, UploadRequest,
    WireDir, WireFile,
};
pub use retry::{Backoff, RECONNECT_CAP, RetryMachine, RetryStep};
pub use session::{ClientSession, PendingDownload, SessionConfig, SessionError};
pub use transfer::{
    ChunkSink, ChunkSource, TransferError, TransferJob, TransferOutcome, TransferSummary,
    checksum_file, crc32_of, is_temp_name, promote, pump, temp_path,
};
